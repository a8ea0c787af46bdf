//! Thread-safe windows with back-pressure.
//!
//! Each blocking window puts one unsynchronized window behind an async
//! mutex and pairs it with two [`Waiter`]s:
//!
//! - `fillable`: signaled when room appears (acknowledge, empty, reset).
//! - `emptiable`: signaled when data appears (fill, reset).
//!
//! # Usage constraint
//!
//! Exactly one task fills and exactly one task empties a given window.
//! With more than one on either side a single-slot signal can wake the
//! wrong task.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use super::pool::BufferPool;
use super::receive::ReceiveWindow;
use super::send::SendWindow;
use super::waiter::Waiter;
use crate::error::{Error, Result};

/// Counter snapshot of a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    /// Bytes staged or received.
    pub filled: u64,
    /// Bytes sent or delivered.
    pub emptied: u64,
    /// Bytes confirmed by the peer (send side only, 0 otherwise).
    pub acknowledged: u64,
}

// =============================================================================
// Send
// =============================================================================

/// [`SendWindow`] shared between a filler and an emptier.
#[derive(Debug)]
pub struct BlockingSendWindow {
    inner: Mutex<SendWindow>,
    fillable: Waiter,
    emptiable: Waiter,
    max_in_flight: u64,
}

impl BlockingSendWindow {
    /// Create a window holding at most `max_in_flight` unacknowledged bytes.
    pub fn new(pool: Arc<BufferPool>, max_in_flight: u64) -> Self {
        Self {
            inner: Mutex::new(SendWindow::new(pool)),
            fillable: Waiter::new(),
            emptiable: Waiter::new(),
            max_in_flight,
        }
    }

    /// Block while unacknowledged bytes reach the cap.
    pub async fn wait_to_fill(&self) -> Result<()> {
        let mut window = self.inner.lock().await;
        loop {
            if let Some(err) = self.fillable.error() {
                return Err(err);
            }
            if window.filled() - window.acknowledged() < self.max_in_flight {
                return Ok(());
            }
            window = self.fillable.wait(&self.inner, window).await?;
        }
    }

    /// Stage all of `data`, returning the new `filled`.
    pub async fn fill(&self, mut data: &[u8]) -> Result<u64> {
        let mut window = self.inner.lock().await;
        if let Some(err) = self.fillable.error() {
            return Err(err);
        }
        while !data.is_empty() {
            let region = window.to_fill();
            let n = region.len().min(data.len());
            region[..n].copy_from_slice(&data[..n]);
            window.filled_n(n);
            data = &data[n..];
        }
        let filled = window.filled();
        drop(window);
        self.emptiable.signal();
        Ok(filled)
    }

    /// Block until there is something to send.
    pub async fn wait_to_empty(&self) -> Result<()> {
        let mut window = self.inner.lock().await;
        loop {
            if let Some(err) = self.emptiable.error() {
                return Err(err);
            }
            if window.emptied() < window.filled() {
                return Ok(());
            }
            window = self.emptiable.wait(&self.inner, window).await?;
        }
    }

    /// Like [`wait_to_empty`], giving up with [`Error::Expired`] after `timeout`.
    ///
    /// [`wait_to_empty`]: BlockingSendWindow::wait_to_empty
    pub async fn wait_to_empty_for(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut window = self.inner.lock().await;
        loop {
            if let Some(err) = self.emptiable.error() {
                return Err(err);
            }
            if window.emptied() < window.filled() {
                return Ok(());
            }
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return Err(Error::Expired);
            }
            window = self.emptiable.wait_for(&self.inner, window, left).await?;
        }
    }

    /// Copy up to `max` unsent bytes without consuming them.
    pub async fn peek(&self, max: usize) -> Vec<u8> {
        self.inner.lock().await.peek(max)
    }

    /// Mark `n` bytes as handed to the transport.
    pub async fn empty(&self, n: usize) {
        let mut window = self.inner.lock().await;
        let mut left = n;
        while left > 0 {
            let chunk = window.to_empty().len().min(left);
            if chunk == 0 {
                break;
            }
            window.empty(chunk);
            left -= chunk;
        }
    }

    /// See [`SendWindow::acknowledge_until`]. Wakes the filler.
    pub async fn acknowledge_until(&self, value: u32) -> Result<u64> {
        let acked = self.inner.lock().await.acknowledge_until(value)?;
        self.fillable.signal();
        Ok(acked)
    }

    /// See [`SendWindow::reset`]. Wakes both sides.
    pub async fn reset(&self, value: u32) -> Result<u64> {
        let target = self.inner.lock().await.reset(value)?;
        self.fillable.signal();
        self.emptiable.signal();
        Ok(target)
    }

    /// Block until the peer acknowledged every staged byte.
    ///
    /// Meant for the filler, after its source hit EOF.
    pub async fn wait_acknowledged(&self) -> Result<()> {
        let mut window = self.inner.lock().await;
        loop {
            if let Some(err) = self.fillable.error() {
                return Err(err);
            }
            if window.acknowledged() == window.filled() {
                return Ok(());
            }
            window = self.fillable.wait(&self.inner, window).await?;
        }
    }

    /// Poison both waiters, failing every current and future wait.
    pub fn fail(&self, err: Error) {
        self.fillable.fail(err.clone());
        self.emptiable.fail(err);
    }

    /// Current counters.
    pub async fn stats(&self) -> WindowStats {
        let window = self.inner.lock().await;
        WindowStats {
            filled: window.filled(),
            emptied: window.emptied(),
            acknowledged: window.acknowledged(),
        }
    }
}

// =============================================================================
// Receive
// =============================================================================

/// [`ReceiveWindow`] shared between a filler and an emptier.
#[derive(Debug)]
pub struct BlockingReceiveWindow {
    inner: Mutex<ReceiveWindow>,
    fillable: Waiter,
    emptiable: Waiter,
    max_in_flight: u64,
}

impl BlockingReceiveWindow {
    /// Create a window holding at most `max_in_flight` undelivered bytes.
    ///
    /// A single fill may overshoot the cap; the cap only gates new fills.
    pub fn new(pool: Arc<BufferPool>, max_in_flight: u64) -> Self {
        Self {
            inner: Mutex::new(ReceiveWindow::new(pool)),
            fillable: Waiter::new(),
            emptiable: Waiter::new(),
            max_in_flight,
        }
    }

    /// Block while undelivered bytes reach the cap.
    pub async fn wait_to_fill(&self) -> Result<()> {
        let mut window = self.inner.lock().await;
        loop {
            if let Some(err) = self.fillable.error() {
                return Err(err);
            }
            if window.filled() - window.emptied() < self.max_in_flight {
                return Ok(());
            }
            window = self.fillable.wait(&self.inner, window).await?;
        }
    }

    /// Accept `data` from the transport, dropping duplicates after a reset.
    ///
    /// Returns the offset of the peer's stream covered so far: accepted
    /// bytes minus duplicates still expected. That is the value to
    /// acknowledge; `filled` itself may run ahead of what the peer resent.
    pub async fn fill(&self, mut data: &[u8]) -> Result<u64> {
        let mut window = self.inner.lock().await;
        if let Some(err) = self.fillable.error() {
            return Err(err);
        }
        let before = window.filled();
        while !data.is_empty() {
            let region = window.to_fill();
            let n = region.len().min(data.len());
            region[..n].copy_from_slice(&data[..n]);
            window.filled_n(n);
            data = &data[n..];
        }
        let filled = window.filled();
        let position = filled - window.skipping();
        drop(window);
        if filled > before {
            self.emptiable.signal();
        }
        Ok(position)
    }

    /// Block until there is something to deliver.
    pub async fn wait_to_empty(&self) -> Result<()> {
        let mut window = self.inner.lock().await;
        loop {
            if let Some(err) = self.emptiable.error() {
                return Err(err);
            }
            if window.emptied() < window.filled() {
                return Ok(());
            }
            window = self.emptiable.wait(&self.inner, window).await?;
        }
    }

    /// Copy up to `max` undelivered bytes without consuming them.
    pub async fn peek(&self, max: usize) -> Vec<u8> {
        self.inner.lock().await.peek(max)
    }

    /// Mark `n` bytes as delivered. Wakes the filler.
    pub async fn empty(&self, n: usize) {
        self.inner.lock().await.empty(n);
        self.fillable.signal();
    }

    /// See [`ReceiveWindow::reset`].
    pub async fn reset(&self, value: u32) -> Result<u64> {
        Ok(self.inner.lock().await.reset(value)?)
    }

    /// Bytes accepted so far.
    pub async fn filled(&self) -> u64 {
        self.inner.lock().await.filled()
    }

    /// Poison both waiters, failing every current and future wait.
    pub fn fail(&self, err: Error) {
        self.fillable.fail(err.clone());
        self.emptiable.fail(err);
    }

    /// Current counters.
    pub async fn stats(&self) -> WindowStats {
        let window = self.inner.lock().await;
        WindowStats {
            filled: window.filled(),
            emptied: window.emptied(),
            acknowledged: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::seq::truncate;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(64))
    }

    // ========== Send Tests ==========

    #[tokio::test]
    async fn test_send_fill_then_peek_empty_ack() {
        let window = BlockingSendWindow::new(pool(), 1024);
        window.wait_to_fill().await.unwrap();
        assert_eq!(window.fill(b"hello world").await.unwrap(), 11);
        window.wait_to_empty().await.unwrap();

        assert_eq!(window.peek(5).await, b"hello".to_vec());
        window.empty(5).await;
        assert_eq!(window.peek(100).await, b" world".to_vec());
        assert_eq!(window.acknowledge_until(5).await.unwrap(), 5);

        let stats = window.stats().await;
        assert_eq!(
            stats,
            WindowStats {
                filled: 11,
                emptied: 5,
                acknowledged: 5
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_wait_to_empty_for_expires_when_idle() {
        let window = BlockingSendWindow::new(pool(), 1024);
        let result = window.wait_to_empty_for(Duration::from_secs(1)).await;
        assert_eq!(result, Err(Error::Expired));
    }

    #[tokio::test]
    async fn test_send_filler_blocks_at_cap_until_ack() {
        let window = Arc::new(BlockingSendWindow::new(pool(), 100));
        window.fill(&[1u8; 100]).await.unwrap();

        let filler = {
            let window = Arc::clone(&window);
            tokio::spawn(async move {
                window.wait_to_fill().await.unwrap();
                window.fill(&[2u8; 10]).await.unwrap()
            })
        };
        tokio::task::yield_now().await;
        assert!(!filler.is_finished(), "filler must block at the cap");

        window.empty(100).await;
        assert!(!filler.is_finished(), "emptying alone does not free send room");
        window.acknowledge_until(truncate(100)).await.unwrap();
        assert_eq!(filler.await.unwrap(), 110);
    }

    #[tokio::test]
    async fn test_send_fail_unblocks_everyone() {
        let window = Arc::new(BlockingSendWindow::new(pool(), 10));
        window.fill(&[0u8; 10]).await.unwrap();

        let filler = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.wait_to_fill().await })
        };
        tokio::task::yield_now().await;

        window.fail(Error::Closed("stop".into()));
        assert_eq!(filler.await.unwrap(), Err(Error::Closed("stop".into())));
        assert!(window.fill(b"x").await.is_err());
        assert!(window.wait_to_empty().await.is_err());
    }

    #[tokio::test]
    async fn test_send_reset_wakes_emptier() {
        let window = Arc::new(BlockingSendWindow::new(pool(), 1024));
        window.fill(b"abcdef").await.unwrap();
        window.empty(6).await;

        let emptier = {
            let window = Arc::clone(&window);
            tokio::spawn(async move {
                window.wait_to_empty().await.unwrap();
                window.peek(100).await
            })
        };
        tokio::task::yield_now().await;
        window.reset(2).await.unwrap();
        assert_eq!(emptier.await.unwrap(), b"cdef".to_vec());
    }

    #[tokio::test]
    async fn test_send_wait_acknowledged() {
        let window = Arc::new(BlockingSendWindow::new(pool(), 1024));
        window.fill(b"abc").await.unwrap();
        window.empty(3).await;

        let drained = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.wait_acknowledged().await })
        };
        tokio::task::yield_now().await;
        window.acknowledge_until(2).await.unwrap();
        tokio::task::yield_now().await;
        assert!(!drained.is_finished());
        window.acknowledge_until(3).await.unwrap();
        assert_eq!(drained.await.unwrap(), Ok(()));
    }

    // ========== Receive Tests ==========

    #[tokio::test]
    async fn test_receive_cap_and_drain() {
        let window = Arc::new(BlockingReceiveWindow::new(pool(), 50));
        window.fill(&[9u8; 50]).await.unwrap();

        let filler = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.wait_to_fill().await })
        };
        tokio::task::yield_now().await;
        assert!(!filler.is_finished());

        window.wait_to_empty().await.unwrap();
        let data = window.peek(20).await;
        window.empty(data.len()).await;
        assert_eq!(filler.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_receive_fill_of_duplicates_does_not_wake_emptier() {
        let window = BlockingReceiveWindow::new(pool(), 1024);
        window.fill(b"0123456789").await.unwrap();
        window.empty(10).await;
        window.reset(4).await.unwrap();

        assert_eq!(window.fill(b"456").await.unwrap(), 7);
        assert_eq!(window.fill(b"789ab").await.unwrap(), 12);
        assert_eq!(window.peek(10).await, b"ab".to_vec());
    }
}
