//! The watch server: one task owning every directory watch.
//!
//! A single worker task holds every notification handle and buffer, so no
//! watch needs internal locking. Any other task wanting to add a watch or
//! shut the server down marshals a command onto the worker's channel rather
//! than touching its state. Completions from the notify side arrive on the
//! same channel, so both are serviced promptly and strictly in the order
//! they became ready.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::NotificationRecord;
use crate::queue::BoundedQueue;
use crate::watch::{Completion, CompletionOutcome, DirectoryWatch, WatchRequest, WatchToken};

/// How long shutdown waits for the worker to drain its cancellations.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// Cross-task control commands, processed in submission order.
#[derive(Debug)]
pub(crate) enum Command {
    AddWatch(WatchRequest),
    Terminate,
}

/// Everything that wakes the worker.
#[derive(Debug)]
pub(crate) enum ServerMsg {
    Command(Command),
    Completion(Completion),
}

/// Handle to the worker task. Submitting a command is fire-and-forget: the
/// caller never waits for the worker to act on it.
pub struct WatchServer {
    tx: mpsc::UnboundedSender<ServerMsg>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WatchServer {
    /// Spawn the worker task. Decoded notification records land on `queue`.
    pub fn spawn(queue: Arc<BoundedQueue<NotificationRecord>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let completions = tx.clone();
        let task = tokio::spawn(serve(rx, completions, queue));
        Self {
            tx,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Ask the worker to open and register a new watch. If the open fails the
    /// request is discarded on the worker, never registered.
    pub fn add_watch(&self, request: WatchRequest) {
        if self
            .tx
            .send(ServerMsg::Command(Command::AddWatch(request)))
            .is_err()
        {
            warn!("watch server is stopped; add-watch request dropped");
        }
    }

    /// Ask the worker to cancel every watch and exit once each cancellation
    /// completion has been observed.
    pub fn terminate(&self) {
        let _ = self.tx.send(ServerMsg::Command(Command::Terminate));
    }

    /// Terminate and wait, bounded, for the worker to exit. A timeout is
    /// tolerated: teardown proceeds and the worker is left to finish on its
    /// own.
    pub async fn shutdown(&self) {
        self.terminate();
        let task = {
            let mut slot = match self.task.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(task) = task {
            match tokio::time::timeout(SHUTDOWN_WAIT, task).await {
                Ok(Ok(())) => debug!("watch server stopped"),
                Ok(Err(err)) => warn!(error = %err, "watch server task failed"),
                Err(_) => warn!("watch server did not stop within the shutdown bound"),
            }
        }
    }
}

/// Worker loop. Exits when termination has been requested and every watch
/// has delivered its terminal completion.
async fn serve(
    mut rx: mpsc::UnboundedReceiver<ServerMsg>,
    completions: mpsc::UnboundedSender<ServerMsg>,
    queue: Arc<BoundedQueue<NotificationRecord>>,
) {
    let mut watches: HashMap<WatchToken, DirectoryWatch> = HashMap::new();
    let mut next_token: WatchToken = 1;
    let mut outstanding = 0usize;
    let mut terminating = false;

    while let Some(msg) = rx.recv().await {
        match msg {
            ServerMsg::Command(Command::AddWatch(request)) => {
                if terminating {
                    debug!("terminating; add-watch request discarded");
                    continue;
                }
                let token = next_token;
                next_token += 1;
                match DirectoryWatch::open(request, token, completions.clone()) {
                    Ok(mut watch) => match watch.begin_read() {
                        Ok(()) => {
                            debug!(
                                path = %watch.path().display(),
                                recursive = watch.is_recursive(),
                                "registered directory watch"
                            );
                            outstanding += 1;
                            watches.insert(token, watch);
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to issue initial read; watch discarded");
                        }
                    },
                    Err(err) => {
                        warn!(error = %err, "failed to open directory watch");
                    }
                }
            }
            ServerMsg::Command(Command::Terminate) => {
                terminating = true;
                info!(watches = watches.len(), "watch server terminating");
                for watch in watches.values_mut() {
                    watch.cancel();
                }
                // Each watch is dropped once its own cancellation completion
                // comes back; nothing is freed eagerly here.
                if outstanding == 0 {
                    break;
                }
            }
            ServerMsg::Completion(completion) => {
                let token = completion.token;
                let Some(watch) = watches.get_mut(&token) else {
                    debug!(token, "completion for unknown watch ignored");
                    continue;
                };
                if watch.on_completion(completion, &queue) == CompletionOutcome::Finished {
                    if let Some(watch) = watches.remove(&token) {
                        debug!(path = %watch.path().display(), "directory watch removed");
                    }
                    outstanding = outstanding.saturating_sub(1);
                    if terminating && outstanding == 0 {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_terminate_with_no_watches_stops_promptly() {
        let queue = Arc::new(BoundedQueue::new(16));
        let server = WatchServer::spawn(queue);
        timeout(Duration::from_secs(2), server.shutdown())
            .await
            .expect("shutdown should not hit its bound");
    }

    #[tokio::test]
    async fn test_watch_drains_through_cancellation_on_shutdown() {
        let root = TempDir::new().expect("tempdir");
        let queue = Arc::new(BoundedQueue::new(64));
        let server = WatchServer::spawn(queue.clone());

        server.add_watch(WatchRequest::new(root.path()));
        // Give the worker a chance to open and arm the watch.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The worker must observe every cancellation completion before it
        // exits; shutdown returning within the bound proves the drain.
        timeout(Duration::from_secs(2), server.shutdown())
            .await
            .expect("worker should drain cancellations and exit");
    }

    #[tokio::test]
    async fn test_unopenable_watch_is_discarded() {
        let queue = Arc::new(BoundedQueue::new(16));
        let server = WatchServer::spawn(queue);

        server.add_watch(WatchRequest::new("/definitely/not/a/real/path"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        timeout(Duration::from_secs(2), server.shutdown())
            .await
            .expect("discarded request must not block shutdown");
    }

    #[tokio::test]
    async fn test_watched_change_reaches_queue() {
        let root = TempDir::new().expect("tempdir");
        let queue = Arc::new(BoundedQueue::new(64));
        let server = WatchServer::spawn(queue.clone());

        server.add_watch(WatchRequest::new(root.path()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(root.path().join("seen.txt"), b"change").expect("write");

        let record = timeout(Duration::from_secs(3), queue.pop())
            .await
            .expect("a record should arrive within the latency bound")
            .expect("record");
        assert!(record.path.ends_with("seen.txt") || record.path == root.path().join("seen.txt"));

        server.shutdown().await;
    }
}
