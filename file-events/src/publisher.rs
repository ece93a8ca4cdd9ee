//! The file-events publisher: configure, run, should-fire, tear-down.
//!
//! Orchestrates the compiler, watch server and notification queue. Failures
//! inside this boundary are logged and counted, never propagated: every
//! operation here reports success to its caller.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compiler::{WatchSet, compile};
use crate::config::{FilePathsConfig, Subscription};
use crate::event::{Action, EventSink, FileChangeEvent, NotificationRecord};
use crate::queue::BoundedQueue;
use crate::server::WatchServer;
use crate::watch::WatchRequest;

/// Capacity of the inter-task notification queue.
pub const QUEUE_CAPACITY: usize = 1000;

/// Per-subscription result of a `configure()` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOutcome {
    pub pattern: String,
    pub category: String,
    /// Concrete directories the pattern resolved to. Empty means the pattern
    /// matched nothing at configure time.
    pub directories: Vec<String>,
}

/// Watches a configured set of directories and hands change events to the
/// subscriber registry's sink.
pub struct FileEventPublisher {
    queue: Arc<BoundedQueue<NotificationRecord>>,
    server: WatchServer,
    exclude: RwLock<HashSet<String>>,
    /// Canonical directories already registered with the server, across
    /// every configure() pass. Re-registering one is a no-op.
    registered: Mutex<WatchSet>,
    sink: Arc<dyn EventSink>,
    shutdown: CancellationToken,
}

impl FileEventPublisher {
    /// Build the publisher and spawn its watch server.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        let queue = Arc::new(BoundedQueue::new(QUEUE_CAPACITY));
        let server = WatchServer::spawn(Arc::clone(&queue));
        Self {
            queue,
            server,
            exclude: RwLock::new(HashSet::new()),
            registered: Mutex::new(WatchSet::new()),
            sink,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token composing this publisher's shutdown with external waits.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Rebuild the exclude set and (re)resolve every subscription. Newly
    /// discovered directories are registered with the watch server;
    /// directories already watched are left alone. Always total: resolution
    /// results come back as per-subscription outcomes, registration failures
    /// surface only in the logs.
    pub fn configure(&self, config: &FilePathsConfig) -> Vec<SubscriptionOutcome> {
        {
            let mut exclude = self.write_exclude();
            exclude.clear();
            exclude.extend(config.exclude_set());
        }

        let mut outcomes = Vec::new();
        let mut registered = self.lock_registered();
        for subscription in config.subscriptions() {
            let compiled = compile(&subscription);
            let mut directories = Vec::with_capacity(compiled.len());
            for (dir, origin) in compiled.iter() {
                directories.push(dir.to_string());
                if registered.insert(dir.to_string(), origin.clone()) {
                    debug!(dir = %dir, pattern = %subscription.pattern, "monitoring new directory");
                    self.server.add_watch(WatchRequest::new(dir));
                }
            }
            if directories.is_empty() {
                warn!(pattern = %subscription.pattern, "subscription resolved to no directories");
            }
            outcomes.push(SubscriptionOutcome {
                pattern: subscription.pattern,
                category: subscription.category,
                directories,
            });
        }
        info!(watched = registered.len(), "configure complete");
        outcomes
    }

    /// One execution step: wait for a queued record (or shutdown), map its
    /// action code and hand the event to the sink. Queue overflow is logged
    /// and cleared; recovery is drop-and-resume.
    pub async fn run(&self) {
        let popped = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            popped = self.queue.pop() => popped,
        };

        if self.queue.overflow() {
            warn!("notification queue overflowed; clearing queued events");
            self.queue.clear();
            return;
        }

        let Some(record) = popped else {
            return;
        };
        match Action::from_code(record.action) {
            Some(action) => {
                let event = FileChangeEvent::new(record.path, action);
                debug!(action = %event.action, path = %event.path.display(), "fire");
                self.sink.fire(event);
            }
            None => debug!(code = record.action, "no action resolved for record"),
        }
    }

    /// Event-time exclusion: an event is suppressed when its full path, or
    /// the directory containing it, is an excluded path.
    pub fn should_fire(&self, _subscription: &Subscription, event: &FileChangeEvent) -> bool {
        let exclude = self.read_exclude();
        if exclude.is_empty() {
            return true;
        }

        let path = event.path.to_string_lossy();
        if exclude.contains(path.as_ref()) {
            return false;
        }
        // Somebody may have excluded the whole directory rather than the
        // individual file; check the parent both with and without its
        // trailing separator.
        if let Some(at) = path.trim_end_matches(['/', '\\']).rfind(['/', '\\']) {
            if exclude.contains(&path[..at]) || exclude.contains(&path[..=at]) {
                return false;
            }
        }
        true
    }

    /// Number of distinct directories registered so far.
    pub fn watched_path_count(&self) -> usize {
        self.lock_registered().len()
    }

    /// Stop the run loop and shut the watch server down, waiting a bounded
    /// time for its watches to drain.
    pub async fn tear_down(&self) {
        self.shutdown.cancel();
        self.server.shutdown().await;
    }

    fn write_exclude(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<String>> {
        match self.exclude.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_exclude(&self) -> std::sync::RwLockReadGuard<'_, HashSet<String>> {
        match self.exclude.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_registered(&self) -> std::sync::MutexGuard<'_, WatchSet> {
        match self.registered.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChannelSink;
    use crate::records::{ACTION_ADDED, ACTION_MODIFIED};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn publisher() -> (FileEventPublisher, tokio::sync::mpsc::UnboundedReceiver<FileChangeEvent>)
    {
        let (sink, rx) = ChannelSink::new();
        (FileEventPublisher::new(Arc::new(sink)), rx)
    }

    fn event(path: &str) -> FileChangeEvent {
        FileChangeEvent::new(path, Action::Updated)
    }

    #[tokio::test]
    async fn test_should_fire_honors_exclude_set() {
        let (publisher, _rx) = publisher();
        let config = FilePathsConfig::default()
            .exclude("windows", r"C:\Windows\System32\calc.exe")
            .exclude("windows", r"C:\Windows\");
        publisher.configure(&config);

        let sub = Subscription::new(r"C:\Windows\**", "windows");
        assert!(publisher.should_fire(&sub, &event(r"C:\Windows\System32\cmd.exe")));
        assert!(!publisher.should_fire(&sub, &event(r"C:\Windows\System32\calc.exe")));
        assert!(!publisher.should_fire(&sub, &event(r"C:\Windows\")));
    }

    #[tokio::test]
    async fn test_should_fire_excludes_children_of_excluded_directory() {
        let (publisher, _rx) = publisher();
        let config = FilePathsConfig::default().exclude("sys", "/proc/");
        publisher.configure(&config);

        let sub = Subscription::new("/**", "sys");
        assert!(!publisher.should_fire(&sub, &event("/proc/cpuinfo")));
        assert!(publisher.should_fire(&sub, &event("/etc/hosts")));
    }

    #[tokio::test]
    async fn test_configure_reports_outcomes_and_is_idempotent() {
        let root = TempDir::new().expect("tempdir");
        let (publisher, _rx) = publisher();
        let config = FilePathsConfig::default()
            .watch("tmp", format!("{}/*", root.path().display()));

        let outcomes = publisher.configure(&config);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].category, "tmp");
        assert_eq!(outcomes[0].directories.len(), 1);
        assert_eq!(publisher.watched_path_count(), 1);

        // Same configuration again: no duplicate registrations.
        publisher.configure(&config);
        assert_eq!(publisher.watched_path_count(), 1);

        publisher.tear_down().await;
    }

    #[tokio::test]
    async fn test_run_maps_record_and_fires() {
        let (publisher, mut rx) = publisher();
        publisher.queue.push(NotificationRecord {
            action: ACTION_ADDED,
            path: PathBuf::from("/srv/data/new.log"),
        });

        publisher.run().await;
        let fired = rx.try_recv().expect("event fired");
        assert_eq!(fired.action, Action::Created);
        assert_eq!(fired.path, PathBuf::from("/srv/data/new.log"));

        publisher.tear_down().await;
    }

    #[tokio::test]
    async fn test_run_clears_overflowed_queue() {
        let (publisher, mut rx) = publisher();
        for n in 0..=QUEUE_CAPACITY {
            publisher.queue.push(NotificationRecord {
                action: ACTION_MODIFIED,
                path: PathBuf::from(format!("/var/spool/{n}")),
            });
        }
        assert!(publisher.queue.overflow());

        publisher.run().await;
        assert!(!publisher.queue.overflow());
        assert!(publisher.queue.is_empty());
        assert!(rx.try_recv().is_err());

        publisher.tear_down().await;
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let (publisher, _rx) = publisher();
        publisher.shutdown_token().cancel();
        // Nothing queued: run() must still return promptly.
        tokio::time::timeout(std::time::Duration::from_secs(1), publisher.run())
            .await
            .expect("run should observe the shutdown signal");

        publisher.tear_down().await;
    }
}
