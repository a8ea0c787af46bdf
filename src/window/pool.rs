//! Fixed-capacity buffer recycling.
//!
//! Windows grow and shrink one [`Buffer`] at a time. Rather than allocate
//! on every frame, drained buffers go back to a shared [`BufferPool`] and
//! are handed out again. The pool is the only object freely shared between
//! tasks without an outer lock, so it carries its own.

// Rust guideline compliant 2026-02

use std::sync::{Mutex, PoisonError};

use crate::constants::POOL_MAX_IDLE;
use crate::counters::{PoolCounters, PoolStats};

/// One fixed-capacity chunk of a window.
///
/// Bytes `[0, offset)` were consumed (emptied), `[offset, len)` are still
/// pending, `[len, capacity)` are free for filling. On the send side
/// `acknowledged` counts the prefix confirmed by the peer, and is always
/// `<= offset`.
pub struct Buffer {
    data: Box<[u8]>,
    pub(crate) len: usize,
    pub(crate) offset: usize,
    pub(crate) acknowledged: usize,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.data.len())
            .field("len", &self.len)
            .field("offset", &self.offset)
            .field("acknowledged", &self.acknowledged)
            .finish()
    }
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            len: 0,
            offset: 0,
            acknowledged: 0,
        }
    }

    /// Fixed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// No room left for filling.
    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    /// Every filled byte was consumed.
    pub fn is_drained(&self) -> bool {
        self.offset == self.len
    }

    /// Writable tail.
    pub(crate) fn free_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Filled but not yet consumed bytes.
    pub(crate) fn unconsumed(&self) -> &[u8] {
        &self.data[self.offset..self.len]
    }

    fn clear(&mut self) {
        self.len = 0;
        self.offset = 0;
        self.acknowledged = 0;
    }
}

/// Thread-safe free list of equally sized buffers.
#[derive(Debug)]
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Buffer>>,
    max_idle: usize,
    counters: PoolCounters,
}

impl BufferPool {
    /// Create a pool handing out buffers of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size == 0`.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::with_max_idle(size, POOL_MAX_IDLE)
    }

    /// Like [`BufferPool::new`], keeping at most `max_idle` free buffers.
    #[must_use]
    pub fn with_max_idle(size: usize, max_idle: usize) -> Self {
        assert!(size > 0, "BufferPool buffer size must be > 0");
        Self {
            size,
            free: Mutex::new(Vec::new()),
            max_idle,
            counters: PoolCounters::default(),
        }
    }

    /// Capacity of every buffer from this pool.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Take a cleared buffer, recycled when possible.
    pub fn get(&self) -> Buffer {
        self.counters.gets.increment();
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        recycled.unwrap_or_else(|| {
            self.counters.news.increment();
            Buffer::new(self.size)
        })
    }

    /// Return a buffer. Its bookkeeping is cleared before reuse.
    ///
    /// Buffers of a foreign size, or beyond the idle limit, are dropped.
    pub fn put(&self, mut buffer: Buffer) {
        self.counters.puts.increment();
        if buffer.capacity() != self.size {
            return;
        }
        buffer.clear();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_idle {
            free.push(buffer);
        }
    }

    /// Number of buffers currently idle in the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Snapshot of get/put/new counters.
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }
}
