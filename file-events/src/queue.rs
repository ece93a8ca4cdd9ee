//! Bounded, overflow-aware notification queue.
//!
//! Producers (watch completion handling on the worker task) never block: a
//! push at capacity drops the item and sets a sticky overflow flag. The
//! single consumer waits on a semaphore that counts available items; the
//! awaitable [`BoundedQueue::pop`] is the wait handle and composes with a
//! shutdown signal through `tokio::select!`.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Semaphore;

/// Fixed-capacity FIFO queue with a sticky overflow flag.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Semaphore,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    overflow: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                overflow: false,
            }),
            available: Semaphore::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an item without blocking. At capacity the item is rejected,
    /// the overflow flag goes sticky-true, and no availability is signaled.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.lock();
        if inner.items.len() >= self.capacity {
            inner.overflow = true;
            return false;
        }
        inner.items.push_back(item);
        self.available.add_permits(1);
        true
    }

    /// Wait until an item is available and remove it.
    ///
    /// A wake with an empty queue (possible after an overflow `clear`)
    /// resynchronizes the availability count and yields `None` instead of
    /// blocking again, so the caller can re-observe queue state.
    pub async fn pop(&self) -> Option<T> {
        match self.available.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return None,
        }
        self.take_front()
    }

    /// Zero-wait variant of [`Self::pop`]. Never blocks and never returns a
    /// stale item.
    pub fn try_pop(&self) -> Option<T> {
        if let Ok(permit) = self.available.try_acquire() {
            permit.forget();
        }
        self.take_front()
    }

    /// Drain every queued item and reset the overflow flag. Recovery after
    /// overflow is drop-and-resume, never replay.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.items.clear();
        inner.overflow = false;
        // Holding the lock keeps producers out while the count resets.
        self.drain_permits();
        drop(inner);
    }

    /// True iff a push has been rejected since the last [`Self::clear`].
    pub fn overflow(&self) -> bool {
        self.lock().overflow
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    fn take_front(&self) -> Option<T> {
        let mut inner = self.lock();
        if inner.items.is_empty() {
            // The availability count can drift ahead of the item count after
            // an overflow clear; reclaim stray permits while producers are
            // locked out.
            self.drain_permits();
            return None;
        }
        inner.items.pop_front()
    }

    fn drain_permits(&self) {
        while let Ok(permit) = self.available.try_acquire() {
            permit.forget();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
