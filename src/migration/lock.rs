//! Advisory-lock based mutual exclusion between migrator processes

use crate::executor::Executor;
use crate::migration::checksum::advisory_lock_key;
use crate::migration::context::Context;
use crate::migration::error::MigrationError;
use std::time::{Duration, Instant};

/// Default time to wait for another migrator to finish
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock guard that releases the advisory lock when dropped
///
/// The lock is a session-scoped `PostgreSQL` advisory lock on a fixed key, so
/// every migrator targeting the same database contends for the same lock no
/// matter which namespace it migrates. Dropping the guard releases it on every
/// exit path, including errors, cancellation and unwinding.
pub struct MigrationLockGuard<'a> {
    executor: &'a dyn Executor,
    key: i64,
}

impl<'a> MigrationLockGuard<'a> {
    /// Acquire the migration lock and create the guard
    ///
    /// Polls `pg_try_advisory_lock` every 100ms until the lock is taken, `timeout`
    /// elapses, or `ctx` is cancelled or expires.
    ///
    /// # Errors
    ///
    /// - `MigrationError::LockTimeout` if another session kept the lock for `timeout`
    /// - `MigrationError::Lock` if the lock query itself failed
    /// - `MigrationError::Cancelled` / `DeadlineExceeded` from `ctx`
    pub fn acquire(
        executor: &'a dyn Executor,
        ctx: &Context,
        timeout: Duration,
    ) -> Result<Self, MigrationError> {
        let key = advisory_lock_key();
        let start = Instant::now();

        loop {
            ctx.check()?;

            if executor.try_advisory_lock(key).map_err(MigrationError::Lock)? {
                log::debug!("Acquired migration lock {key}");
                return Ok(Self { executor, key });
            }

            if start.elapsed() >= timeout {
                return Err(MigrationError::LockTimeout(timeout));
            }

            log::debug!("Migration lock {key} is held by another session, waiting");
            let mut pause = POLL_INTERVAL.min(timeout.saturating_sub(start.elapsed()));
            if let Some(remaining) = ctx.remaining() {
                pause = pause.min(remaining);
            }
            std::thread::sleep(pause);
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn executor(&self) -> &'a dyn Executor {
        self.executor
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        // Errors cannot be propagated from drop; the session ending frees the lock anyway.
        match self.executor.advisory_unlock(self.key) {
            Ok(()) => log::debug!("Released migration lock {}", self.key),
            Err(e) => log::warn!("Failed to release migration lock {}: {e}", self.key),
        }
    }
}
