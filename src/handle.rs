//! Replaceable transport handle.
//!
//! Holds the one live [`Transport`] of a tunnel or session and lets a
//! reconnect swap it without touching the windows.
//!
//! ```text
//!            set                     close
//!   empty ---------> attached ---------------> closed
//!     ^                 |  \  set (replace)       ^
//!     |    error        |   '------.              |
//!     '-----------------'          v              |
//!                               attached ---------'
//! ```
//!
//! Whoever calls [`ReplaceableTransport::set`] gets an [`Attachment`]; it
//! resolves exactly once, when that transport stops being current.
//!
//! The last agreed offsets live in two atomics. They are written under the
//! slot lock, only for the current transport, and read without it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{oneshot, Notify};

use crate::counters::TransportCounters;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Why an attached transport stopped being current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eviction {
    /// A newer transport took over.
    Replaced,
    /// The transport failed; the handle is empty and can be reattached.
    Failed(Error),
    /// The handle was closed for good.
    Closed(Error),
}

/// One-shot notice handed to whoever attached a transport.
#[derive(Debug)]
pub struct Attachment {
    generation: u64,
    rx: oneshot::Receiver<Eviction>,
}

impl Attachment {
    /// Attach counter value at the time of this attachment.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolve once the transport is no longer current.
    pub async fn wait(self) -> Eviction {
        self.rx
            .await
            .unwrap_or_else(|_| Eviction::Closed(Error::Closed("transport handle dropped".into())))
    }
}

#[derive(Debug, Default)]
struct Slot {
    current: Option<Arc<Transport>>,
    owner: Option<oneshot::Sender<Eviction>>,
    error: Option<Error>,
    generation: u64,
    orphaned_since: Option<Instant>,
}

/// Swappable slot for the live transport of one logical stream.
#[derive(Debug)]
pub struct ReplaceableTransport {
    slot: Mutex<Slot>,
    attached: Notify,
    written_until: AtomicU32,
    read_until: AtomicU32,
    counters: Arc<TransportCounters>,
}

impl ReplaceableTransport {
    /// Create an empty handle.
    pub fn new(counters: Arc<TransportCounters>) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            attached: Notify::new(),
            written_until: AtomicU32::new(0),
            read_until: AtomicU32::new(0),
            counters,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `transport` current, resuming at the given truncated offsets.
    ///
    /// `read_until` is how much of the peer's stream this side has, and
    /// `written_until` how much of ours the peer has. A previously attached
    /// transport is closed and its owner told [`Eviction::Replaced`].
    ///
    /// # Errors
    ///
    /// The terminal error if the handle is closed. The transport is closed
    /// in that case too.
    pub fn set(
        &self,
        transport: Arc<Transport>,
        read_until: u32,
        written_until: u32,
    ) -> Result<Attachment> {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut slot = self.lock();
            if let Some(err) = &slot.error {
                transport.close();
                return Err(err.clone());
            }
            if let Some(old) = slot.current.take() {
                old.close();
                self.counters.replaced.increment();
                log::info!(
                    "[Handle] transport #{} replaced by #{}",
                    old.id(),
                    transport.id()
                );
            }
            if let Some(owner) = slot.owner.take() {
                let _ = owner.send(Eviction::Replaced);
            }
            if read_until == 0 && written_until == 0 {
                self.counters.started.increment();
            } else {
                self.counters.resumed.increment();
            }

            self.read_until.store(read_until, Ordering::Release);
            self.written_until.store(written_until, Ordering::Release);
            slot.current = Some(transport);
            slot.owner = Some(tx);
            slot.generation += 1;
            slot.orphaned_since = None;
            slot.generation
        };
        self.attached.notify_waiters();
        Ok(Attachment { generation, rx })
    }

    /// Evict `transport` after a failure.
    ///
    /// Ignored unless `transport` is still current: a task holding an
    /// already replaced transport must not evict its successor. Returns
    /// whether the eviction happened.
    pub fn error(&self, transport: &Transport, err: Error) -> bool {
        let mut slot = self.lock();
        match &slot.current {
            Some(current) if current.id() == transport.id() => {}
            _ => {
                log::debug!(
                    "[Handle] stale error from transport #{}: {}",
                    transport.id(),
                    err
                );
                return false;
            }
        }
        if let Some(current) = slot.current.take() {
            current.close();
        }
        slot.orphaned_since = Some(Instant::now());
        self.counters.orphaned.increment();
        log::warn!("[Handle] transport #{} failed: {}", transport.id(), err);
        if let Some(owner) = slot.owner.take() {
            let _ = owner.send(Eviction::Failed(err));
        }
        true
    }

    /// Close the handle for good. Idempotent; the first error wins.
    ///
    /// Blocked and future getters fail with `err`, the current owner is
    /// told [`Eviction::Closed`].
    pub fn close(&self, err: Error) {
        {
            let mut slot = self.lock();
            if slot.error.is_some() {
                return;
            }
            slot.error = Some(err.clone());
            if let Some(current) = slot.current.take() {
                current.close();
                self.counters.closed.increment();
            }
            if let Some(owner) = slot.owner.take() {
                self.counters.stopped.increment();
                let _ = owner.send(Eviction::Closed(err));
            }
        }
        self.attached.notify_waiters();
    }

    /// Terminal error, if closed.
    pub fn closed_error(&self) -> Option<Error> {
        self.lock().error.clone()
    }

    /// When the last transport failed, if none is attached since.
    pub fn orphaned_since(&self) -> Option<Instant> {
        self.lock().orphaned_since
    }

    /// Whether a transport is currently attached.
    pub fn is_attached(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Number of successful [`ReplaceableTransport::set`] calls.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    async fn wait_for<T>(&self, mut pick: impl FnMut(&Arc<Transport>) -> T) -> Result<T> {
        loop {
            let notified = self.attached.notified();
            tokio::pin!(notified);
            {
                let slot = self.lock();
                if let Some(err) = &slot.error {
                    return Err(err.clone());
                }
                if let Some(current) = &slot.current {
                    return Ok(pick(current));
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Current transport, waiting for one to be attached.
    pub async fn get(&self) -> Result<Arc<Transport>> {
        self.wait_for(Arc::clone).await
    }

    /// Current transport with `(written_until, read_until)`, read together
    /// with it.
    pub async fn get_for_send(&self) -> Result<(Arc<Transport>, u32, u32)> {
        self.wait_for(|current| {
            (
                Arc::clone(current),
                self.written_until.load(Ordering::Acquire),
                self.read_until.load(Ordering::Acquire),
            )
        })
        .await
    }

    /// Current transport with `read_until`, read together with it.
    pub async fn get_for_receive(&self) -> Result<(Arc<Transport>, u32)> {
        self.wait_for(|current| (Arc::clone(current), self.read_until.load(Ordering::Acquire)))
            .await
    }

    /// `(written_until, read_until)` without waiting.
    pub fn get_write_read_until(&self) -> (u32, u32) {
        (
            self.written_until.load(Ordering::Acquire),
            self.read_until.load(Ordering::Acquire),
        )
    }

    /// Record how much of the peer's stream this side has, as reported
    /// over `transport`. Ignored for a transport that is no longer current.
    pub fn push_read_until(&self, transport: &Transport, value: u32) {
        if self.is_current(transport) {
            self.read_until.store(value, Ordering::Release);
        }
    }

    /// Record how much of this side's stream the peer has, as reported
    /// over `transport`. Ignored for a transport that is no longer current.
    pub fn push_written_until(&self, transport: &Transport, value: u32) {
        if self.is_current(transport) {
            self.written_until.store(value, Ordering::Release);
        }
    }

    fn is_current(&self, transport: &Transport) -> bool {
        matches!(&self.lock().current, Some(current) if current.id() == transport.id())
    }
}
