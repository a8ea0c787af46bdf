//! Unsynchronized send window.
//!
//! Bytes flow through three absolute counters:
//!
//! ```text
//!   acknowledged      emptied          filled
//!        |  pending      |    active      |   free
//! -------+---------------+----------------+--------->
//!   released       sent, kept for      staged, not
//!   to the pool    a possible resend   yet sent
//! ```
//!
//! `acknowledged <= emptied <= filled` holds after every operation. Buffers
//! that were fully sent move from the active chain to the pending chain and
//! stay there until the peer acknowledges them, so a reconnect can rewind
//! and resend.

use std::collections::VecDeque;
use std::sync::Arc;

use super::pool::{Buffer, BufferPool};
use super::seq::to_absolute;
use crate::error::WindowError;

/// Sliding send window over pooled buffers.
#[derive(Debug)]
pub struct SendWindow {
    pool: Arc<BufferPool>,
    /// Buffers holding bytes not yet emptied. Only the front may be
    /// partially emptied.
    active: VecDeque<Buffer>,
    /// Fully emptied buffers waiting for acknowledgment.
    pending: VecDeque<Buffer>,
    filled: u64,
    emptied: u64,
    acknowledged: u64,
}

impl SendWindow {
    /// Create an empty window drawing buffers from `pool`.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            active: VecDeque::new(),
            pending: VecDeque::new(),
            filled: 0,
            emptied: 0,
            acknowledged: 0,
        }
    }

    /// Bytes staged so far.
    pub fn filled(&self) -> u64 {
        self.filled
    }

    /// Bytes handed to a transport so far.
    pub fn emptied(&self) -> u64 {
        self.emptied
    }

    /// Bytes confirmed by the peer so far.
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    /// Writable tail of the last buffer, allocating one if the last is full.
    pub fn to_fill(&mut self) -> &mut [u8] {
        if self.active.back().map_or(true, Buffer::is_full) {
            self.active.push_back(self.pool.get());
        }
        match self.active.back_mut() {
            Some(last) => last.free_mut(),
            None => &mut [],
        }
    }

    /// Commit `n` bytes written into the region returned by [`to_fill`].
    ///
    /// [`to_fill`]: SendWindow::to_fill
    pub fn filled_n(&mut self, n: usize) {
        if let Some(last) = self.active.back_mut() {
            let n = n.min(last.capacity() - last.len);
            last.len += n;
            self.filled += n as u64;
        }
    }

    /// Unsent prefix of the oldest active buffer. Empty when nothing is staged.
    pub fn to_empty(&self) -> &[u8] {
        self.active
            .front()
            .map(Buffer::unconsumed)
            .unwrap_or_default()
    }

    /// Mark `n` bytes of [`to_empty`] as handed to the transport.
    ///
    /// [`to_empty`]: SendWindow::to_empty
    pub fn empty(&mut self, n: usize) {
        let only = self.active.len() == 1;
        let Some(front) = self.active.front_mut() else {
            return;
        };
        let n = n.min(front.len - front.offset);
        front.offset += n;
        self.emptied += n as u64;

        // A drained, partially filled tail keeps accepting new bytes.
        let keep_filling = only && !front.is_full();
        if front.is_drained() && !keep_filling {
            if let Some(done) = self.active.pop_front() {
                self.pending.push_back(done);
            }
        }
    }

    /// Copy up to `max` unsent bytes, across buffer boundaries, without
    /// consuming them.
    pub fn peek(&self, max: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max.min((self.filled - self.emptied) as usize));
        for buffer in &self.active {
            if out.len() >= max {
                break;
            }
            let chunk = buffer.unconsumed();
            let take = chunk.len().min(max - out.len());
            out.extend_from_slice(&chunk[..take]);
        }
        out
    }

    /// Advance `acknowledged` by `n`, releasing fully acknowledged buffers.
    ///
    /// Callers validate `n` first: only emptied bytes can be acknowledged.
    pub fn acknowledge(&mut self, n: u64) {
        let mut left = n.min(self.emptied - self.acknowledged);
        self.acknowledged += left;

        while left > 0 {
            if let Some(buffer) = self.pending.front_mut() {
                let take = left.min((buffer.offset - buffer.acknowledged) as u64);
                buffer.acknowledged += take as usize;
                left -= take;
                if buffer.acknowledged == buffer.len {
                    if let Some(done) = self.pending.pop_front() {
                        self.pool.put(done);
                    }
                } else if take == 0 {
                    break;
                }
                continue;
            }

            // Only the front of the active chain can be partially emptied.
            match self.active.front_mut() {
                Some(buffer) => {
                    let take = left.min((buffer.offset - buffer.acknowledged) as u64);
                    buffer.acknowledged += take as usize;
                    left -= take;
                    if take == 0 {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    /// Acknowledge up to the absolute offset the truncated `value` resolves to.
    ///
    /// Returns the resolved absolute offset.
    pub fn acknowledge_until(&mut self, value: u32) -> Result<u64, WindowError> {
        let absolute = to_absolute(self.acknowledged, value);
        if absolute > self.emptied {
            return Err(WindowError::ImpossibleAck {
                value: absolute,
                emptied: self.emptied,
            });
        }
        if absolute < self.acknowledged {
            return Err(WindowError::PoliticalAck {
                value: absolute,
                acknowledged: self.acknowledged,
            });
        }
        self.acknowledge(absolute - self.acknowledged);
        Ok(absolute)
    }

    /// Rewind so that the next [`to_empty`] starts at the offset the
    /// truncated `value` resolves to.
    ///
    /// Everything before the target is treated as acknowledged, everything
    /// after it and before `emptied` will be sent again.
    ///
    /// [`to_empty`]: SendWindow::to_empty
    pub fn reset(&mut self, value: u32) -> Result<u64, WindowError> {
        let target = to_absolute(self.acknowledged, value);
        if target < self.acknowledged {
            return Err(WindowError::ResetBeforeAcknowledged {
                value: target,
                acknowledged: self.acknowledged,
            });
        }
        if target > self.emptied {
            return Err(WindowError::ResetPastEmptied {
                value: target,
                emptied: self.emptied,
            });
        }

        self.acknowledge(target - self.acknowledged);

        while let Some(buffer) = self.pending.pop_back() {
            self.active.push_front(buffer);
        }
        for buffer in &mut self.active {
            buffer.offset = buffer.acknowledged;
        }
        self.emptied = target;
        Ok(target)
    }

    /// Return every buffer to the pool. The counters are left untouched.
    pub fn drop_buffers(&mut self) {
        for buffer in self.pending.drain(..).chain(self.active.drain(..)) {
            self.pool.put(buffer);
        }
    }
}

impl Drop for SendWindow {
    fn drop(&mut self) {
        self.drop_buffers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::seq::truncate;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn fill_all(window: &mut SendWindow, mut data: &[u8], chunk: usize) {
        while !data.is_empty() {
            let region = window.to_fill();
            let n = region.len().min(chunk).min(data.len());
            region[..n].copy_from_slice(&data[..n]);
            window.filled_n(n);
            data = &data[n..];
        }
    }

    fn drain_all(window: &mut SendWindow, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let region = window.to_empty();
            if region.is_empty() {
                return out;
            }
            let n = region.len().min(chunk);
            out.extend_from_slice(&region[..n]);
            window.empty(n);
        }
    }

    fn check_invariant(window: &SendWindow) {
        assert!(window.acknowledged() <= window.emptied());
        assert!(window.emptied() <= window.filled());
    }

    // ========== Fill and Empty Tests ==========

    #[test]
    fn test_round_trip_various_capacities() {
        let reference = payload(10_000);
        for capacity in [16, 17, 100, 4096, 16_384] {
            for chunk in [1, 7, 64, 1000] {
                let pool = Arc::new(BufferPool::new(capacity));
                let mut window = SendWindow::new(pool);
                fill_all(&mut window, &reference, chunk);
                let out = drain_all(&mut window, chunk + 3);
                assert_eq!(out, reference, "capacity {capacity} chunk {chunk}");
                assert_eq!(window.filled(), 10_000);
                assert_eq!(window.emptied(), 10_000);
                check_invariant(&window);
            }
        }
    }

    #[test]
    fn test_interleaved_fill_and_empty() {
        let reference = payload(5000);
        let pool = Arc::new(BufferPool::new(64));
        let mut window = SendWindow::new(pool);
        let mut out = Vec::new();
        for piece in reference.chunks(37) {
            fill_all(&mut window, piece, 11);
            out.extend(drain_all(&mut window, 5));
            check_invariant(&window);
        }
        assert_eq!(out, reference);
    }

    #[test]
    fn test_peek_crosses_buffers_without_consuming() {
        let reference = payload(100);
        let pool = Arc::new(BufferPool::new(16));
        let mut window = SendWindow::new(pool);
        fill_all(&mut window, &reference, 100);
        window.empty(5);

        assert_eq!(window.peek(40), reference[5..45].to_vec());
        assert_eq!(window.peek(1000), reference[5..].to_vec());
        assert_eq!(window.emptied(), 5);
    }

    #[test]
    fn test_empty_window_has_nothing_to_empty() {
        let pool = Arc::new(BufferPool::new(16));
        let mut window = SendWindow::new(pool);
        assert!(window.to_empty().is_empty());
        window.empty(10);
        assert_eq!(window.emptied(), 0);
    }

    // ========== Acknowledge Tests ==========

    #[test]
    fn test_acknowledge_releases_buffers() {
        let pool = Arc::new(BufferPool::new(16));
        let mut window = SendWindow::new(Arc::clone(&pool));
        fill_all(&mut window, &payload(64), 64);
        drain_all(&mut window, 64);

        window.acknowledge(40);
        assert_eq!(window.acknowledged(), 40);
        assert_eq!(pool.stats().puts, 2, "two full buffers acknowledged");
        check_invariant(&window);

        window.acknowledge(24);
        assert_eq!(pool.stats().puts, 4);
    }

    #[test]
    fn test_acknowledge_until_validates() {
        let pool = Arc::new(BufferPool::new(32));
        let mut window = SendWindow::new(pool);
        fill_all(&mut window, &payload(100), 100);
        window.empty(32);
        window.empty(28);

        assert!(matches!(
            window.acknowledge_until(61),
            Err(WindowError::ImpossibleAck {
                value: 61,
                emptied: 60
            })
        ));

        assert_eq!(window.acknowledge_until(50), Ok(50));
        assert!(matches!(
            window.acknowledge_until(49),
            Err(WindowError::PoliticalAck {
                value: 49,
                acknowledged: 50
            })
        ));
        assert_eq!(window.acknowledge_until(50), Ok(50));
        assert_eq!(window.acknowledge_until(60), Ok(60));
        check_invariant(&window);
    }

    #[test]
    fn test_acknowledge_partial_active_front() {
        let pool = Arc::new(BufferPool::new(64));
        let mut window = SendWindow::new(pool);
        fill_all(&mut window, &payload(50), 50);
        window.empty(30);
        assert_eq!(window.acknowledge_until(20), Ok(20));
        let rest = drain_all(&mut window, 100);
        assert_eq!(rest, payload(50)[30..].to_vec());
    }

    // ========== Reset Tests ==========

    #[test]
    fn test_reset_replays_from_target() {
        let reference = payload(3000);
        for capacity in [16, 100, 1024] {
            for target in [0u64, 1, 15, 16, 400, 599, 600] {
                let pool = Arc::new(BufferPool::new(capacity));
                let mut window = SendWindow::new(pool);
                fill_all(&mut window, &reference, 333);

                // Only 600 bytes made it out before the transport dropped.
                let mut sent = 0;
                while sent < 600 {
                    let n = window.to_empty().len().min(600 - sent);
                    window.empty(n);
                    sent += n;
                }

                assert_eq!(window.reset(truncate(target)), Ok(target));
                assert_eq!(window.emptied(), target);
                assert_eq!(window.acknowledged(), target);
                check_invariant(&window);

                let replay = drain_all(&mut window, 50);
                assert_eq!(
                    replay,
                    reference[target as usize..].to_vec(),
                    "capacity {capacity} target {target}"
                );
            }
        }
    }

    #[test]
    fn test_reset_after_partial_ack_resends_unacknowledged_once() {
        let reference = payload(1000);
        let pool = Arc::new(BufferPool::new(128));
        let mut window = SendWindow::new(pool);
        fill_all(&mut window, &reference, 1000);

        let mut sent = 0;
        while sent < 600 {
            let n = window.to_empty().len().min(600 - sent);
            window.empty(n);
            sent += n;
        }
        window.acknowledge_until(400).unwrap();

        // Peer reconnects saying it only has the first 400 bytes.
        window.reset(400).unwrap();
        let replay = drain_all(&mut window, 1000);
        assert_eq!(replay.len(), 600);
        assert_eq!(replay, reference[400..].to_vec());
    }

    #[test]
    fn test_reset_bounds() {
        let pool = Arc::new(BufferPool::new(32));
        let mut window = SendWindow::new(pool);
        fill_all(&mut window, &payload(100), 100);
        window.empty(32);
        window.empty(32);
        window.acknowledge_until(20).unwrap();

        assert!(matches!(
            window.reset(10),
            Err(WindowError::ResetBeforeAcknowledged { .. })
        ));
        assert!(matches!(
            window.reset(65),
            Err(WindowError::ResetPastEmptied { .. })
        ));
        // Failed resets leave the window untouched.
        assert_eq!(window.emptied(), 64);
        assert_eq!(window.acknowledged(), 20);
        assert_eq!(window.reset(64), Ok(64));
    }

    #[test]
    fn test_reset_twice_then_continue() {
        let reference = payload(500);
        let pool = Arc::new(BufferPool::new(40));
        let mut window = SendWindow::new(pool);
        fill_all(&mut window, &reference, 500);
        window.empty(40);
        window.empty(40);
        window.reset(50).unwrap();
        window.empty(20);
        window.reset(60).unwrap();

        let replay = drain_all(&mut window, 33);
        assert_eq!(replay, reference[60..].to_vec());
    }

    #[test]
    fn test_fill_after_reset_appends() {
        let reference = payload(300);
        let pool = Arc::new(BufferPool::new(64));
        let mut window = SendWindow::new(pool);
        fill_all(&mut window, &reference[..100], 100);
        drain_all(&mut window, 100);
        window.reset(30).unwrap();
        fill_all(&mut window, &reference[100..], 100);

        assert_eq!(drain_all(&mut window, 7), reference[30..].to_vec());
    }

    #[test]
    fn test_drop_returns_buffers_to_pool() {
        let pool = Arc::new(BufferPool::new(16));
        {
            let mut window = SendWindow::new(Arc::clone(&pool));
            fill_all(&mut window, &payload(100), 100);
            window.empty(20);
        }
        let stats = pool.stats();
        assert_eq!(stats.gets, stats.puts);
    }
}
