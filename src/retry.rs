//! Exponential backoff for reconnect loops.
//!
//! Delays start at `min_delay` and double up to `max_delay`. A fatal error
//! (see [`Error::is_fatal`]) or cancellation ends retrying at once.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::duration_ms;
use crate::constants::{RETRY_MAX_DELAY, RETRY_MIN_DELAY};
use crate::error::{Error, Result};

/// Backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// First delay.
    #[serde(with = "duration_ms")]
    pub min_delay: Duration,
    /// Delay cap.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Attempts before giving up, 0 for unlimited.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: RETRY_MIN_DELAY,
            max_delay: RETRY_MAX_DELAY,
            attempts: 0,
        }
    }
}

/// Backoff state for one loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    next: Duration,
    failures: u32,
}

impl Backoff {
    /// Fresh state: the next delay is `min_delay`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            next: policy.min_delay,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait, or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.policy.attempts != 0 && self.failures >= self.policy.attempts {
            return None;
        }
        let delay = self.next;
        self.next = (self.next * 2).min(self.policy.max_delay);
        Some(delay)
    }

    /// Back to `min_delay` and a full attempt budget.
    pub fn reset(&mut self) {
        self.next = self.policy.min_delay;
        self.failures = 0;
    }

    /// Failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Sleep for `delay` unless `cancel` fires first. Returns false if
/// cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Run `op` until it succeeds, fails fatally, runs out of attempts, or
/// `cancel` fires.
///
/// # Errors
///
/// The fatal or last error, or [`Error::Closed`] on cancellation.
pub async fn retry<T, F, Fut>(
    description: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(policy);
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Closed(format!("{description}: cancelled")));
        }
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_fatal() => {
                log::error!("[Retry] {} failed for good: {}", description, err);
                return Err(err);
            }
            Err(err) => err,
        };
        let Some(delay) = backoff.next_delay() else {
            log::error!(
                "[Retry] {} failed {} times, giving up: {}",
                description,
                backoff.failures(),
                err
            );
            return Err(err);
        };
        log::warn!(
            "[Retry] {} failed: {} (retry in {:?})",
            description,
            err,
            delay
        );
        if !sleep_or_cancel(delay, cancel).await {
            return Err(Error::Closed(format!("{description}: cancelled")));
        }
    }
}
