//! One asynchronous watch on one directory.
//!
//! A [`DirectoryWatch`] owns the notification handle for a single directory
//! and a pair of 16 KiB buffers. Issuing a read hands the active buffer to
//! the watch's [`ReadSlot`], the completion source fed by the notify
//! backend, and the completion hands it back filled with encoded change
//! records. On a successful completion the worker copies active to backup,
//! reissues the read, and only then decodes: the next read is always
//! outstanding before decoding begins, so notification loss is bounded by
//! the backend's own buffering rather than by decode latency.
//!
//! Everything here is mutated exclusively on the watch server's task; the
//! slot is the one piece shared with the notify callback thread and carries
//! its own lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{FileEventsError, Result};
use crate::event::NotificationRecord;
use crate::queue::BoundedQueue;
use crate::records::{
    ACTION_ADDED, ACTION_MODIFIED, ACTION_REMOVED, ACTION_RENAMED_NEW_NAME,
    ACTION_RENAMED_OLD_NAME, ChangeRecord, DEFAULT_BUFFER_SIZE, DEFAULT_FILTER,
    FILTER_ATTRIBUTES, FILTER_DIR_NAME, FILTER_FILE_NAME, FILTER_LAST_WRITE, FILTER_SECURITY,
    FILTER_SIZE, decode_batch, encode_batch,
};
use crate::server::ServerMsg;

/// Stable identifier the server uses to route completions to their watch.
pub(crate) type WatchToken = u64;

/// Everything needed to open one directory watch.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub path: PathBuf,
    pub recursive: bool,
    pub filter: u32,
    pub buffer_size: usize,
}

impl WatchRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recursive: false,
            filter: DEFAULT_FILTER,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Why a completion was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionStatus {
    /// The read produced a batch of change records.
    Success,
    /// More changes arrived than fit the buffer; the batch was dropped at
    /// the source. Defined lossy condition, not a fault.
    Overflow,
    /// The watch was cancelled; this is its terminal completion.
    Cancelled,
}

/// One completion delivered to the worker task.
#[derive(Debug)]
pub(crate) struct Completion {
    pub token: WatchToken,
    pub status: CompletionStatus,
    /// The buffer that was armed for this read, handed back to the watch.
    pub buffer: Option<Vec<u8>>,
    /// Valid bytes in `buffer`.
    pub len: usize,
}

/// What the server should do with the watch after a completion.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CompletionOutcome {
    /// The watch reissued its read and stays registered.
    Continue,
    /// Terminal: the watch may now be removed and dropped.
    Finished,
}

struct SlotState {
    /// Buffer handed over by `begin_read`, owned by the completion source
    /// while the read is outstanding.
    armed: Option<Vec<u8>>,
    /// Records buffered while no read is armed.
    staged: Vec<ChangeRecord>,
    staged_bytes: usize,
    /// The staging budget was exceeded; the next completion reports it.
    staged_overflow: bool,
    closed: bool,
}

/// Completion source for one watch. The notify callback encodes change
/// records into it; arming it with a buffer produces a completion once
/// records are available.
pub(crate) struct ReadSlot {
    token: WatchToken,
    base: PathBuf,
    filter: u32,
    capacity: usize,
    completions: mpsc::UnboundedSender<ServerMsg>,
    state: Mutex<SlotState>,
}

impl ReadSlot {
    pub(crate) fn new(
        token: WatchToken,
        base: PathBuf,
        filter: u32,
        capacity: usize,
        completions: mpsc::UnboundedSender<ServerMsg>,
    ) -> Self {
        Self {
            token,
            base,
            filter,
            capacity,
            completions,
            state: Mutex::new(SlotState {
                armed: None,
                staged: Vec::new(),
                staged_bytes: 0,
                staged_overflow: false,
                closed: false,
            }),
        }
    }

    /// Hand a buffer over for the next read. Completes immediately if
    /// records (or an overflow) are already staged.
    pub(crate) fn arm(&self, buffer: Vec<u8>) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(FileEventsError::WatchClosed(self.base.display().to_string()));
        }
        if state.armed.is_some() {
            return Err(FileEventsError::ReadOutstanding(
                self.base.display().to_string(),
            ));
        }
        state.armed = Some(buffer);
        if state.staged_overflow || !state.staged.is_empty() {
            self.flush(&mut state);
        }
        Ok(())
    }

    /// Close the slot. With `emit_cancellation` the terminal completion is
    /// queued for the worker; without it the slot goes silent (used when a
    /// watch self-terminates before ever being registered).
    pub(crate) fn close(&self, emit_cancellation: bool) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.staged.clear();
        state.staged_bytes = 0;
        let buffer = state.armed.take();
        drop(state);

        if emit_cancellation {
            let _ = self.completions.send(ServerMsg::Completion(Completion {
                token: self.token,
                status: CompletionStatus::Cancelled,
                buffer,
                len: 0,
            }));
        }
    }

    /// Entry point for the notify backend callback.
    pub(crate) fn on_notify(&self, outcome: notify::Result<notify::Event>) {
        let event = match outcome {
            Ok(event) => event,
            Err(err) => {
                debug!(base = %self.base.display(), error = %err, "notify backend error");
                return;
            }
        };

        let records = self.records_for(&event);
        if records.is_empty() {
            return;
        }

        let mut state = self.lock();
        if state.closed {
            return;
        }
        for record in records {
            if state.staged_overflow {
                // The whole batch is already lost; keep dropping until the
                // overflow is reported through a completion.
                break;
            }
            let encoded = record.encoded_len();
            if state.staged_bytes + encoded > self.capacity {
                state.staged.clear();
                state.staged_bytes = 0;
                state.staged_overflow = true;
                break;
            }
            state.staged_bytes += encoded;
            state.staged.push(record);
        }
        if state.armed.is_some() {
            self.flush(&mut state);
        }
    }

    fn flush(&self, state: &mut SlotState) {
        let Some(mut buffer) = state.armed.take() else {
            return;
        };

        let completion = if state.staged_overflow {
            state.staged_overflow = false;
            Completion {
                token: self.token,
                status: CompletionStatus::Overflow,
                buffer: Some(buffer),
                len: 0,
            }
        } else {
            let staged = std::mem::take(&mut state.staged);
            state.staged_bytes = 0;
            let len = encode_batch(&staged, &mut buffer);
            Completion {
                token: self.token,
                status: CompletionStatus::Success,
                buffer: Some(buffer),
                len,
            }
        };

        let _ = self.completions.send(ServerMsg::Completion(completion));
    }

    /// Map one notify event into change records, honoring the change filter.
    fn records_for(&self, event: &notify::Event) -> Vec<ChangeRecord> {
        use notify::EventKind;
        use notify::event::{ModifyKind, RenameMode};

        let name_changes = self.filter & (FILTER_FILE_NAME | FILTER_DIR_NAME) != 0;
        let mut records = Vec::new();
        match &event.kind {
            EventKind::Create(_) if name_changes => {
                for path in &event.paths {
                    records.push(ChangeRecord::new(ACTION_ADDED, self.relative_name(path)));
                }
            }
            EventKind::Remove(_) if name_changes => {
                for path in &event.paths {
                    records.push(ChangeRecord::new(ACTION_REMOVED, self.relative_name(path)));
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) if name_changes => match mode {
                RenameMode::From => {
                    for path in &event.paths {
                        records.push(ChangeRecord::new(
                            ACTION_RENAMED_OLD_NAME,
                            self.relative_name(path),
                        ));
                    }
                }
                RenameMode::To => {
                    for path in &event.paths {
                        records.push(ChangeRecord::new(
                            ACTION_RENAMED_NEW_NAME,
                            self.relative_name(path),
                        ));
                    }
                }
                RenameMode::Both => {
                    // First path is the old name, second the new one.
                    if let Some(old) = event.paths.first() {
                        records.push(ChangeRecord::new(
                            ACTION_RENAMED_OLD_NAME,
                            self.relative_name(old),
                        ));
                    }
                    if let Some(new) = event.paths.get(1) {
                        records.push(ChangeRecord::new(
                            ACTION_RENAMED_NEW_NAME,
                            self.relative_name(new),
                        ));
                    }
                }
                _ => {
                    for path in &event.paths {
                        records.push(ChangeRecord::new(ACTION_MODIFIED, self.relative_name(path)));
                    }
                }
            },
            EventKind::Modify(ModifyKind::Metadata(_)) => {
                if self.filter & (FILTER_ATTRIBUTES | FILTER_SECURITY) != 0 {
                    for path in &event.paths {
                        records.push(ChangeRecord::new(ACTION_MODIFIED, self.relative_name(path)));
                    }
                }
            }
            EventKind::Modify(_) => {
                if self.filter & (FILTER_SIZE | FILTER_LAST_WRITE) != 0 {
                    for path in &event.paths {
                        records.push(ChangeRecord::new(ACTION_MODIFIED, self.relative_name(path)));
                    }
                }
            }
            // Access notifications are outside the change filter.
            _ => {}
        }
        records
    }

    fn relative_name(&self, path: &Path) -> String {
        match path.strip_prefix(&self.base) {
            Ok(relative) => relative.to_string_lossy().into_owned(),
            Err(_) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One registered directory watch. Owned exclusively by the watch server and
/// destroyed only after its terminal completion has been observed there.
pub(crate) struct DirectoryWatch {
    path: PathBuf,
    recursive: bool,
    buffer_size: usize,
    /// The notification handle. `None` once released.
    handle: Option<RecommendedWatcher>,
    slot: Arc<ReadSlot>,
    active: Option<Vec<u8>>,
    backup: Vec<u8>,
    /// A read is outstanding and a completion is expected.
    pending: bool,
}

impl DirectoryWatch {
    /// Open the directory for change notification. Failure means the caller
    /// discards the watch without registering it.
    pub(crate) fn open(
        request: WatchRequest,
        token: WatchToken,
        completions: mpsc::UnboundedSender<ServerMsg>,
    ) -> Result<Self> {
        let path = request.path;
        if !path.is_dir() {
            return Err(FileEventsError::NotADirectory(path.display().to_string()));
        }

        let slot = Arc::new(ReadSlot::new(
            token,
            path.clone(),
            request.filter,
            request.buffer_size,
            completions,
        ));

        let callback_slot = Arc::clone(&slot);
        let mut handle = notify::recommended_watcher(move |outcome: notify::Result<notify::Event>| {
            callback_slot.on_notify(outcome);
        })
        .map_err(|source| FileEventsError::Open {
            path: path.display().to_string(),
            source,
        })?;

        let mode = if request.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        handle
            .watch(&path, mode)
            .map_err(|source| FileEventsError::Open {
                path: path.display().to_string(),
                source,
            })?;

        Ok(Self {
            path,
            recursive: request.recursive,
            buffer_size: request.buffer_size,
            handle: Some(handle),
            slot,
            active: Some(vec![0u8; request.buffer_size]),
            backup: vec![0u8; request.buffer_size],
            pending: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Issue the next asynchronous read. On failure the watch self-terminates:
    /// the handle is released and no retry is attempted.
    pub(crate) fn begin_read(&mut self) -> Result<()> {
        let buffer = self
            .active
            .take()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        match self.slot.arm(buffer) {
            Ok(()) => {
                self.pending = true;
                Ok(())
            }
            Err(err) => {
                self.release();
                Err(err)
            }
        }
    }

    /// Handle one completion on the worker task.
    pub(crate) fn on_completion(
        &mut self,
        completion: Completion,
        queue: &BoundedQueue<NotificationRecord>,
    ) -> CompletionOutcome {
        if !self.pending {
            debug!(path = %self.path.display(), "completion without an outstanding read");
        }
        self.pending = false;
        match completion.status {
            CompletionStatus::Cancelled => {
                self.release();
                CompletionOutcome::Finished
            }
            CompletionStatus::Overflow => {
                warn!(
                    path = %self.path.display(),
                    "change notifications overflowed the read buffer; batch dropped"
                );
                if let Some(buffer) = completion.buffer {
                    self.active = Some(buffer);
                }
                self.reissue()
            }
            CompletionStatus::Success => {
                let Some(buffer) = completion.buffer else {
                    // A success completion always carries its buffer back.
                    self.release();
                    return CompletionOutcome::Finished;
                };
                let len = completion.len.min(buffer.len()).min(self.backup.len());

                // Copy the batch aside, get the next read outstanding, and
                // only then decode. This ordering is load-bearing.
                self.backup[..len].copy_from_slice(&buffer[..len]);
                self.active = Some(buffer);
                let outcome = self.reissue();

                for record in decode_batch(&self.backup[..len]) {
                    let full_path = self.path.join(&record.name);
                    if !queue.push(NotificationRecord {
                        action: record.action,
                        path: full_path,
                    }) {
                        debug!(path = %self.path.display(), "notification queue full; record dropped");
                    }
                }
                outcome
            }
        }
    }

    /// Cancel the outstanding read and release the handle. The server keeps
    /// the watch alive until the cancellation completion comes back through
    /// the worker.
    pub(crate) fn cancel(&mut self) {
        self.slot.close(true);
        self.handle = None;
    }

    fn reissue(&mut self) -> CompletionOutcome {
        match self.begin_read() {
            Ok(()) => CompletionOutcome::Continue,
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to reissue read; watch terminated"
                );
                CompletionOutcome::Finished
            }
        }
    }

    fn release(&mut self) {
        self.slot.close(false);
        self.handle = None;
    }
}
