//! Error types for the file-events crate.

use thiserror::Error;

/// Result type alias for file-events operations.
pub type Result<T> = std::result::Result<T, FileEventsError>;

/// Errors that can occur while watching for file changes.
///
/// None of these escape the publisher boundary: `configure()` and `run()`
/// swallow them after logging. They exist so the internal layers can
/// propagate failure with `?` instead of panicking.
#[derive(Error, Debug)]
pub enum FileEventsError {
    /// A directory could not be opened for monitoring.
    #[error("failed to open directory for monitoring: {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: notify::Error,
    },

    /// The path given to a watch request is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A read could not be issued because the watch was already torn down.
    #[error("watch closed: {0}")]
    WatchClosed(String),

    /// A read was issued while a previous one was still outstanding.
    #[error("read already outstanding for: {0}")]
    ReadOutstanding(String),

    /// The watch server is no longer accepting commands.
    #[error("watch server stopped")]
    ServerStopped,

    /// Notify backend error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parse error.
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}
