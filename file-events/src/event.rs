//! Events produced for the subscriber registry.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::records::{
    ACTION_ADDED, ACTION_MODIFIED, ACTION_REMOVED, ACTION_RENAMED_NEW_NAME,
    ACTION_RENAMED_OLD_NAME,
};

/// Semantic file actions, in mapping priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Created,
    Deleted,
    Updated,
    MovedFrom,
    MovedTo,
}

/// Priority-ordered mapping from raw action bits to semantic actions.
/// The first entry whose bit is present in the code wins.
const ACTION_TABLE: [(u32, Action); 5] = [
    (ACTION_ADDED, Action::Created),
    (ACTION_REMOVED, Action::Deleted),
    (ACTION_MODIFIED, Action::Updated),
    (ACTION_RENAMED_OLD_NAME, Action::MovedFrom),
    (ACTION_RENAMED_NEW_NAME, Action::MovedTo),
];

impl Action {
    /// Map a raw action code to a semantic action. Total and deterministic:
    /// a single-bit code has exactly one match; a multi-bit code resolves to
    /// the earliest entry in priority order; an unknown code maps to none.
    pub fn from_code(code: u32) -> Option<Self> {
        ACTION_TABLE
            .iter()
            .find(|(mask, _)| code & mask != 0)
            .map(|(_, action)| *action)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Deleted => "DELETED",
            Self::Updated => "UPDATED",
            Self::MovedFrom => "MOVED_FROM",
            Self::MovedTo => "MOVED_TO",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded change popped off the notification queue: a raw action code
/// and the full path it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub action: u32,
    pub path: PathBuf,
}

/// An event handed to the registry for fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangeEvent {
    /// Full path of the affected file or directory.
    pub path: PathBuf,

    /// What happened to it.
    pub action: Action,

    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

impl FileChangeEvent {
    pub fn new(path: impl Into<PathBuf>, action: Action) -> Self {
        Self {
            path: path.into(),
            action,
            timestamp: Utc::now(),
        }
    }
}

/// The seam to the external publish/subscribe registry. The registry owns
/// subscriber dispatch and row construction; this crate only produces events
/// for it.
pub trait EventSink: Send + Sync {
    fn fire(&self, event: FileChangeEvent);
}

/// Sink that forwards events into an unbounded channel. Convenient for
/// consumers that drain events from an async loop, and for tests.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<FileChangeEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FileChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn fire(&self, event: FileChangeEvent) {
        // The consumer hanging up is not this side's problem.
        let _ = self.tx.send(event);
    }
}
