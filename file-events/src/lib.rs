//! # File Events
//!
//! Filesystem change sensing for the hostmon agent. This crate watches a
//! configured set of directories and reports create/delete/modify/rename
//! activity to the subscriber registry with low latency and without silent,
//! unbounded event loss.
//!
//! ## Features
//!
//! - **Asynchronous Watching**: One double-buffered watch per directory
//! - **Single-Owner Worker**: A dedicated task owns every handle and buffer
//! - **Bounded Queue**: Overflow is a reported condition, never silent loss
//! - **Pattern Compilation**: Leaf, stem and recursive-descent wildcards
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      File Event Publisher                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  FilePathsConfig ──► SubscriptionCompiler ──► WatchSet          │
//! │        │                                         │              │
//! │        ▼                                         ▼              │
//! │   ExcludeSet                WatchServer ──► DirectoryWatch      │
//! │        │                         │               │              │
//! │        ▼                         ▼               ▼              │
//! │   should_fire ◄── run ◄── BoundedQueue ◄── change records       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Subscriptions compile into concrete directories; the watch server opens
//! one asynchronous watch per directory and decodes completions into records
//! on the bounded queue; the publisher's run step maps raw action codes to
//! semantic actions and hands events to the registry's sink.

pub mod compiler;
pub mod config;
pub mod error;
pub mod event;
pub mod publisher;
pub mod queue;
pub mod records;
pub mod server;
pub mod watch;

pub use compiler::{MatchMode, WatchOrigin, WatchSet, compile};
pub use config::{FilePathsConfig, Subscription};
pub use error::{FileEventsError, Result};
pub use event::{Action, ChannelSink, EventSink, FileChangeEvent, NotificationRecord};
pub use publisher::{FileEventPublisher, QUEUE_CAPACITY, SubscriptionOutcome};
pub use queue::BoundedQueue;
pub use records::{ChangeRecord, DEFAULT_BUFFER_SIZE, DEFAULT_FILTER};
pub use server::WatchServer;
pub use watch::WatchRequest;
