//! End-to-end publisher tests: real directories, real change notifications.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hostmon_file_events::{
    Action, ChannelSink, FileChangeEvent, FileEventPublisher, FilePathsConfig,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

/// Upper bound on how long a filesystem change may take to surface.
const MAX_EVENT_LATENCY: Duration = Duration::from_secs(3);

async fn wait_for_event<F>(
    rx: &mut UnboundedReceiver<FileChangeEvent>,
    mut accept: F,
) -> Option<FileChangeEvent>
where
    F: FnMut(&FileChangeEvent) -> bool,
{
    let deadline = Instant::now() + MAX_EVENT_LATENCY;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(event)) if accept(&event) => return Some(event),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

fn spawn_run_loop(publisher: Arc<FileEventPublisher>) -> tokio::task::JoinHandle<()> {
    let token = publisher.shutdown_token();
    tokio::spawn(async move {
        while !token.is_cancelled() {
            publisher.run().await;
        }
    })
}

#[tokio::test]
async fn test_create_then_update_surface_within_latency_bound() {
    let root = TempDir::new().expect("tempdir");
    let (sink, mut rx) = ChannelSink::new();
    let publisher = Arc::new(FileEventPublisher::new(Arc::new(sink)));

    let config =
        FilePathsConfig::default().watch("integration", format!("{}/", root.path().display()));
    let outcomes = publisher.configure(&config);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].directories.len(), 1);

    let run_loop = spawn_run_loop(Arc::clone(&publisher));
    // Registration is fire-and-forget; give the worker a moment to arm.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let target = root.path().join("trigger.txt");
    std::fs::write(&target, b"first").expect("create trigger file");

    let created = wait_for_event(&mut rx, |event| {
        event.path.file_name().is_some_and(|name| name == "trigger.txt")
    })
    .await
    .expect("creating a file should surface an event");
    assert!(
        created.action == Action::Created || created.action == Action::Updated,
        "unexpected action {:?}",
        created.action
    );

    std::fs::write(&target, b"second, longer content").expect("rewrite trigger file");

    let updated = wait_for_event(&mut rx, |event| {
        event.action == Action::Updated
            && event.path.file_name().is_some_and(|name| name == "trigger.txt")
    })
    .await;
    assert!(updated.is_some(), "writing the file should surface UPDATED");

    publisher.tear_down().await;
    run_loop.await.expect("run loop should stop after tear-down");
}

#[tokio::test]
async fn test_delete_surfaces_deleted_event() {
    let root = TempDir::new().expect("tempdir");
    let target = root.path().join("doomed.txt");
    std::fs::write(&target, b"ephemeral").expect("create file");

    let (sink, mut rx) = ChannelSink::new();
    let publisher = Arc::new(FileEventPublisher::new(Arc::new(sink)));
    let config =
        FilePathsConfig::default().watch("integration", format!("{}/", root.path().display()));
    publisher.configure(&config);

    let run_loop = spawn_run_loop(Arc::clone(&publisher));
    tokio::time::sleep(Duration::from_millis(300)).await;

    std::fs::remove_file(&target).expect("remove file");

    let deleted = wait_for_event(&mut rx, |event| {
        event.action == Action::Deleted
            && event.path.file_name().is_some_and(|name| name == "doomed.txt")
    })
    .await;
    assert!(deleted.is_some(), "removing the file should surface DELETED");

    publisher.tear_down().await;
    run_loop.await.expect("run loop should stop after tear-down");
}

#[tokio::test]
async fn test_tear_down_is_bounded_and_repeat_safe() {
    let root = TempDir::new().expect("tempdir");
    let (sink, _rx) = ChannelSink::new();
    let publisher = Arc::new(FileEventPublisher::new(Arc::new(sink)));
    let config =
        FilePathsConfig::default().watch("integration", format!("{}/", root.path().display()));
    publisher.configure(&config);

    tokio::time::timeout(Duration::from_secs(5), publisher.tear_down())
        .await
        .expect("tear-down should finish well inside its bound");
    // A second tear-down must be harmless.
    publisher.tear_down().await;
}
