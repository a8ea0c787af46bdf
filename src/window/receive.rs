//! Unsynchronized receive window.
//!
//! `filled` counts bytes accepted from a transport, `emptied` bytes handed
//! to the application; `emptied <= filled` always holds.
//!
//! After a reconnect the peer may resend bytes this side already accepted.
//! [`ReceiveWindow::reset`] arms a skip counter so the next fills drop
//! exactly that overlap, and forces a fresh buffer so the discarded prefix
//! never has to be cut out of the middle of undelivered data.

use std::collections::VecDeque;
use std::sync::Arc;

use super::pool::{Buffer, BufferPool};
use super::seq::to_absolute;
use crate::error::WindowError;

/// Sliding receive window over pooled buffers.
#[derive(Debug)]
pub struct ReceiveWindow {
    pool: Arc<BufferPool>,
    chain: VecDeque<Buffer>,
    filled: u64,
    emptied: u64,
    /// Bytes still to be discarded after a reset.
    skip: u64,
}

impl ReceiveWindow {
    /// Create an empty window drawing buffers from `pool`.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            chain: VecDeque::new(),
            filled: 0,
            emptied: 0,
            skip: 0,
        }
    }

    /// Bytes accepted so far, not counting discarded duplicates.
    pub fn filled(&self) -> u64 {
        self.filled
    }

    /// Bytes delivered so far.
    pub fn emptied(&self) -> u64 {
        self.emptied
    }

    /// Duplicate bytes still expected from the peer.
    pub fn skipping(&self) -> u64 {
        self.skip
    }

    /// Writable tail of the last buffer, allocating one if the last is full.
    pub fn to_fill(&mut self) -> &mut [u8] {
        if self.chain.back().map_or(true, Buffer::is_full) {
            self.chain.push_back(self.pool.get());
        }
        match self.chain.back_mut() {
            Some(last) => last.free_mut(),
            None => &mut [],
        }
    }

    /// Commit `n` bytes written into the region returned by [`to_fill`].
    ///
    /// While a skip is armed the leading duplicates are dropped: if the whole
    /// chunk is duplicate nothing advances and the next [`to_fill`] hands out
    /// the same region again.
    ///
    /// Returns the new `filled`.
    ///
    /// [`to_fill`]: ReceiveWindow::to_fill
    pub fn filled_n(&mut self, n: usize) -> u64 {
        let Some(last) = self.chain.back_mut() else {
            return self.filled;
        };
        let n = n.min(last.capacity() - last.len);
        let mut kept = n;

        if self.skip > 0 {
            let discard = self.skip.min(n as u64) as usize;
            self.skip -= discard as u64;
            if discard == n {
                return self.filled;
            }
            // Reset left this buffer with nothing undelivered.
            last.offset = last.len + discard;
            kept = n - discard;
        }

        last.len += n;
        self.filled += kept as u64;
        self.filled
    }

    /// Undelivered prefix of the oldest buffer.
    pub fn to_empty(&self) -> &[u8] {
        self.chain
            .front()
            .map(Buffer::unconsumed)
            .unwrap_or_default()
    }

    /// Copy up to `max` undelivered bytes without consuming them.
    pub fn peek(&self, max: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max.min((self.filled - self.emptied) as usize));
        for buffer in &self.chain {
            if out.len() >= max {
                break;
            }
            let chunk = buffer.unconsumed();
            let take = chunk.len().min(max - out.len());
            out.extend_from_slice(&chunk[..take]);
        }
        out
    }

    /// Mark `n` bytes as delivered, releasing drained buffers.
    pub fn empty(&mut self, mut n: usize) {
        while n > 0 {
            let only = self.chain.len() == 1;
            let Some(front) = self.chain.front_mut() else {
                return;
            };
            let take = n.min(front.len - front.offset);
            front.offset += take;
            self.emptied += take as u64;
            n -= take;

            if front.is_drained() && (front.is_full() || !only) {
                if let Some(done) = self.chain.pop_front() {
                    self.pool.put(done);
                }
            } else if take == 0 {
                return;
            }
        }
    }

    /// Reconcile with the peer's idea of how much it delivered to us.
    ///
    /// `value` resolves against `filled`. Equal is a no-op, ahead is an
    /// error, behind arms a skip of the difference.
    pub fn reset(&mut self, value: u32) -> Result<u64, WindowError> {
        let absolute = to_absolute(self.filled, value);
        if absolute == self.filled {
            self.skip = 0;
            return Ok(absolute);
        }
        if absolute > self.filled {
            return Err(WindowError::ResetPastFilled {
                value: absolute,
                filled: self.filled,
            });
        }

        self.skip = self.filled - absolute;
        let only = self.chain.len() == 1;
        match self.chain.back_mut() {
            Some(last) if last.is_drained() && only => {
                last.len = 0;
                last.offset = 0;
            }
            Some(last) if last.len > 0 => {
                let fresh = self.pool.get();
                self.chain.push_back(fresh);
            }
            _ => {}
        }
        Ok(absolute)
    }

    /// Return every buffer to the pool. The counters are left untouched.
    pub fn drop_buffers(&mut self) {
        for buffer in self.chain.drain(..) {
            self.pool.put(buffer);
        }
    }
}

impl Drop for ReceiveWindow {
    fn drop(&mut self) {
        self.drop_buffers();
    }
}
