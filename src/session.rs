//! Server-side session table and orphan expiration.
//!
//! A [`Session`] binds a sid to an [`Endpoint`] whose far side is a
//! downstream TCP connection. Sessions outlive their WebSocket transports:
//! when a transport goes away the session is *orphaned* and waits for the
//! browser to resume it. It is *deleted* once its endpoint closes.
//!
//! Sids are handed out by `/proxy` as [`Ticket`]s: a short-lived binding of
//! the sid to the destination it was issued for. The first `/connect`
//! redeems the ticket by creating the session.
//!
//! [`ExpirationPolicy`] bounds how many orphans pile up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::duration_ms;
use crate::counters::{ExpireCounters, SessionCounters};
use crate::endpoint::Endpoint;
use crate::error::Error;

/// One resumable server-side stream.
#[derive(Debug)]
pub struct Session {
    sid: String,
    host: String,
    port: u16,
    endpoint: Endpoint,
    created: Instant,
}

impl Session {
    /// Bind `sid` to an endpoint relaying to `host:port`.
    pub fn new(
        sid: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            sid: sid.into(),
            host: host.into(),
            port,
            endpoint,
            created: Instant::now(),
        }
    }

    /// Session id.
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Destination host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` the session relays to, bracketing IPv6 literals.
    pub fn destination(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// The session's stream endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Time since creation.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

/// Destination a sid was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Destination host.
    pub host: String,
    /// Destination port.
    pub port: u16,
    issued: Instant,
}

/// All live and orphaned sessions, plus outstanding tickets.
#[derive(Debug)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    tickets: Mutex<HashMap<String, Ticket>>,
    ticket_ttl: Duration,
    counters: Arc<SessionCounters>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionTable {
    /// Create an empty table. Unused tickets lapse after `ticket_ttl`.
    pub fn new(ticket_ttl: Duration, counters: Arc<SessionCounters>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            tickets: Mutex::new(HashMap::new()),
            ticket_ttl,
            counters,
        }
    }

    /// Issue a fresh sid for `host:port`.
    pub fn issue(&self, host: &str, port: u16) -> String {
        let sid = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        let mut tickets = lock(&self.tickets);
        tickets.retain(|_, ticket| now.duration_since(ticket.issued) < self.ticket_ttl);
        tickets.insert(
            sid.clone(),
            Ticket {
                host: host.to_string(),
                port,
                issued: now,
            },
        );
        sid
    }

    /// Destination of an unredeemed, unexpired ticket.
    pub fn ticket(&self, sid: &str) -> Option<Ticket> {
        let tickets = lock(&self.tickets);
        tickets
            .get(sid)
            .filter(|ticket| ticket.issued.elapsed() < self.ticket_ttl)
            .cloned()
    }

    /// Look up a session for resumption.
    ///
    /// A session whose endpoint already closed is treated as gone; its
    /// supervisor is about to delete it.
    pub fn get(&self, sid: &str) -> Option<Arc<Session>> {
        let session = lock(&self.sessions).get(sid).cloned()?;
        if session.endpoint().is_closed() {
            self.counters.invalid.increment();
            return None;
        }
        Some(session)
    }

    /// Count a resumption once a new transport is attached to a looked-up
    /// session.
    pub fn resumed(&self) {
        self.counters.resumed.increment();
    }

    /// Insert `session`, redeeming its ticket.
    ///
    /// Returns `None` if the sid is already taken; the caller lost a race
    /// against a parallel `/connect` with the same sid.
    pub fn create(&self, session: Session) -> Option<Arc<Session>> {
        let session = Arc::new(session);
        {
            let mut sessions = lock(&self.sessions);
            if sessions.contains_key(session.sid()) {
                return None;
            }
            sessions.insert(session.sid().to_string(), Arc::clone(&session));
        }
        lock(&self.tickets).remove(session.sid());
        self.counters.created.increment();
        Some(session)
    }

    /// Remove a session. Idempotent; returns whether it was present.
    pub fn delete(&self, sid: &str) -> bool {
        let removed = lock(&self.sessions).remove(sid).is_some();
        if removed {
            self.counters.deleted.increment();
        }
        removed
    }

    /// Record that a session lost its transport.
    pub fn orphan(&self, sid: &str) {
        self.counters.orphaned.increment();
        log::debug!("[Session] {} orphaned", short_sid(sid));
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// True if there are no sessions.
    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    /// Copy of every session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.sessions).values().cloned().collect()
    }

    /// Delete `session` from `table` once its endpoint closes.
    pub fn supervise(table: &Arc<Self>, session: &Arc<Session>) {
        let table = Arc::clone(table);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let err = session.endpoint().closed().await;
            if table.delete(session.sid()) {
                log::info!(
                    "[Session] {} to {} deleted: {}",
                    short_sid(session.sid()),
                    session.destination(),
                    err
                );
            }
        });
    }
}

/// `host:port`, with brackets around hosts that contain a colon.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// First characters of a sid, enough to tell sessions apart in logs.
pub fn short_sid(sid: &str) -> &str {
    sid.get(..6).unwrap_or(sid)
}

// =============================================================================
// Expiration
// =============================================================================

/// When to close orphaned sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationPolicy {
    /// Sweep period, zero disables sweeping.
    #[serde(with = "duration_ms")]
    pub every: Duration,
    /// Above this many orphans, the oldest are closed regardless of age.
    pub ruthless_threshold: usize,
    /// Below this many orphans nothing is closed.
    pub orphan_threshold: usize,
    /// Orphans younger than this survive unless the ruthless threshold is
    /// exceeded.
    #[serde(with = "duration_ms")]
    pub orphan_limit: Duration,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self {
            every: Duration::from_secs(10 * 60),
            ruthless_threshold: 20_000,
            orphan_threshold: 1_000,
            orphan_limit: Duration::from_secs(72 * 24 * 60 * 60),
        }
    }
}

impl ExpirationPolicy {
    /// One sweep at `now`.
    ///
    /// Orphans are visited oldest first while more than `orphan_threshold`
    /// remain. Above `ruthless_threshold` each one is closed; otherwise
    /// only those orphaned longer than `orphan_limit` are, and the sweep
    /// stops at the first younger one. A session resumed since the scan is
    /// skipped and counted as raced.
    pub fn expire_once(&self, table: &SessionTable, now: Instant, counters: &ExpireCounters) {
        counters.runs.increment();
        if table.len() < self.orphan_threshold {
            return;
        }

        let mut orphaned: Vec<(Arc<Session>, Instant)> = table
            .sessions()
            .into_iter()
            .filter_map(|session| {
                let since = session.endpoint().handle().orphaned_since()?;
                (since <= now).then_some((session, since))
            })
            .collect();
        if orphaned.len() < self.orphan_threshold {
            return;
        }
        counters.above_threshold_runs.increment();
        orphaned.sort_by_key(|(_, since)| *since);

        let mut left = orphaned.len();
        for (session, since) in orphaned {
            if left <= self.orphan_threshold {
                break;
            }
            let ruthless = left > self.ruthless_threshold;
            left -= 1;

            if session.endpoint().handle().orphaned_since() != Some(since) {
                counters.raced.increment();
                continue;
            }

            let idle = now.saturating_duration_since(since);
            if ruthless {
                counters.ruthless_closed.increment();
            } else {
                if idle <= self.orphan_limit {
                    break;
                }
                counters.orphan_closed.increment();
            }

            log::info!(
                "[Expire] closing {} to {} after {:?} orphaned",
                short_sid(session.sid()),
                session.destination(),
                idle
            );
            session.endpoint().close(Error::Closed(format!(
                "session expired after {idle:?} of inactivity"
            )));
            table.delete(session.sid());
        }
    }

    /// Sweep every `every` until `cancel` fires. Returns at once if
    /// sweeping is disabled.
    pub async fn run(
        self,
        table: Arc<SessionTable>,
        counters: Arc<ExpireCounters>,
        cancel: CancellationToken,
    ) {
        if self.every.is_zero() {
            return;
        }
        let mut interval = tokio::time::interval(self.every);
        interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            self.expire_once(&table, Instant::now(), &counters);
        }
    }
}
