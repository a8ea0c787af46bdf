//! Single-slot signal bound to an external async mutex.
//!
//! A [`Waiter`] lets a task holding a [`tokio::sync::Mutex`] guard give it
//! up, sleep until another task calls [`Waiter::signal`], and take the lock
//! back. A signal with nobody waiting is remembered (one slot), so a wakeup
//! sent between "checked the condition" and "went to sleep" is never lost.
//!
//! [`Waiter::fail`] poisons the waiter for good: every current and future
//! wait returns that error.

use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::error::{Error, Result};

/// Condition-variable style wakeup with permanent failure.
#[derive(Debug, Default)]
pub struct Waiter {
    notify: Notify,
    failed: StdMutex<Option<Error>>,
}

impl Waiter {
    /// Create a waiter with no pending signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Error set by [`Waiter::fail`], if any.
    pub fn error(&self) -> Option<Error> {
        self.failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Release `guard`, block until signaled, then lock `lock` again.
    pub async fn wait<'a, T>(
        &self,
        lock: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
    ) -> Result<MutexGuard<'a, T>> {
        self.check()?;
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Registered before the guard goes away: a signal sent as soon as
        // the lock is free still reaches this task.
        notified.as_mut().enable();
        drop(guard);

        notified.await;
        let guard = lock.lock().await;
        self.check()?;
        Ok(guard)
    }

    /// Like [`Waiter::wait`], giving up with [`Error::Expired`] after `timeout`.
    ///
    /// On expiry the lock is not reacquired.
    pub async fn wait_for<'a, T>(
        &self,
        lock: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> Result<MutexGuard<'a, T>> {
        self.check()?;
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(guard);

        if tokio::time::timeout(timeout, notified).await.is_err() {
            self.check()?;
            return Err(Error::Expired);
        }
        let guard = lock.lock().await;
        self.check()?;
        Ok(guard)
    }

    /// Wake one pending wait, or remember the signal for the next one.
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// Poison the waiter. The first error wins.
    pub fn fail(&self, err: Error) {
        {
            let mut failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
            if failed.is_none() {
                *failed = Some(err);
            }
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    fn check(&self) -> Result<()> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_signal_before_wait_is_kept() {
        let lock = Mutex::new(0u32);
        let waiter = Waiter::new();
        waiter.signal();

        let guard = lock.lock().await;
        let guard = tokio::time::timeout(Duration::from_secs(1), waiter.wait(&lock, guard))
            .await
            .expect("pending signal must satisfy the wait")
            .unwrap();
        assert_eq!(*guard, 0);
    }

    #[tokio::test]
    async fn test_wait_releases_lock_while_blocked() {
        let lock = Arc::new(Mutex::new(0u32));
        let waiter = Arc::new(Waiter::new());

        let task = {
            let lock = Arc::clone(&lock);
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move {
                let mut guard = lock.lock().await;
                while *guard == 0 {
                    guard = waiter.wait(&lock, guard).await.unwrap();
                }
                *guard
            })
        };

        tokio::task::yield_now().await;
        {
            // Would deadlock if the waiting task still held the guard.
            let mut guard = lock.lock().await;
            *guard = 7;
        }
        waiter.signal();
        assert_eq!(task.await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_expires() {
        let lock = Mutex::new(());
        let waiter = Waiter::new();
        let guard = lock.lock().await;
        let result = waiter
            .wait_for(&lock, guard, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(Error::Expired)));
        // The lock is free again.
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_fail_wakes_current_and_future_waits() {
        let lock = Arc::new(Mutex::new(()));
        let waiter = Arc::new(Waiter::new());

        let task = {
            let lock = Arc::clone(&lock);
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move {
                let guard = lock.lock().await;
                waiter.wait(&lock, guard).await.map(|_| ())
            })
        };
        tokio::task::yield_now().await;

        waiter.fail(Error::Closed("done".into()));
        waiter.fail(Error::Closed("second".into()));
        assert_eq!(task.await.unwrap(), Err(Error::Closed("done".into())));

        let guard = lock.lock().await;
        let result = waiter.wait(&lock, guard).await.map(|_| ());
        assert_eq!(result, Err(Error::Closed("done".into())));
    }
}
