//! Exclusive migration lock
//!
//! At most one runner per database may apply or revert migrations at a time.
//! Both executors scope the lock to the session that took it: a PostgreSQL
//! advisory lock, or on SQLite an exclusive transaction on a lock file held by
//! a connection the executor owns. A runner that dies without releasing frees
//! the lock when its connection closes.

use crate::executor::SchemaExecutor;
use crate::migration::MigrationError;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Default lock key, "LOCKKEEP" in ASCII
pub const DEFAULT_LOCK_KEY: i64 = 0x4c4f_434b_4b45_4550;

/// Lock guard that automatically releases the lock when dropped
pub struct MigrationLockGuard<'a> {
    executor: &'a dyn SchemaExecutor,
    key: i64,
    waited: Duration,
}

impl<'a> MigrationLockGuard<'a> {
    /// Acquire the migration lock, polling every `poll_interval` for at most
    /// `timeout`
    ///
    /// A zero `timeout` makes a single attempt. Between attempts a coroutine
    /// yields to the `may` scheduler; a plain thread sleeps.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockTimeout` if the lock is still held elsewhere
    /// when the timeout expires, or `MigrationError::Database` if a lock attempt
    /// fails outright.
    pub fn acquire(
        executor: &'a dyn SchemaExecutor,
        key: i64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::acquire_lock_span(key).entered();

        let start = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if executor.try_advisory_lock(key)? {
                let waited = start.elapsed();
                log::debug!("Acquired migration lock {key} after {attempts} attempt(s)");
                return Ok(Self {
                    executor,
                    key,
                    waited,
                });
            }

            let waited = start.elapsed();
            if waited >= timeout {
                log::warn!("Gave up on migration lock {key} after {waited:?}");
                return Err(MigrationError::LockTimeout { key, waited });
            }
            if attempts == 1 {
                log::info!("Migration lock {key} is held by another session, waiting up to {timeout:?}");
            }
            pause(poll_interval.min(timeout - waited));
        }
    }

    /// How long acquisition took
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn key(&self) -> i64 {
        self.key
    }
}

fn pause(duration: Duration) {
    if may::coroutine::is_coroutine() {
        may::coroutine::sleep(duration);
    } else {
        std::thread::sleep(duration);
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.executor.advisory_unlock(self.key) {
            log::warn!("Failed to release migration lock {}: {e}", self.key);
        }
    }
}


#[cfg(test)]
mod coroutine_tests {
    use super::*;
    use crate::executor::{Dialect, ExecutorError, SqlRow, SqlValue};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Lock that is always held by someone else
    struct Contended {
        attempts: Arc<AtomicU32>,
    }

    impl SchemaExecutor for Contended {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }
        fn execute(&self, _: &str, _: &[SqlValue]) -> Result<u64, ExecutorError> {
            Ok(0)
        }
        fn batch_execute(&self, _: &str) -> Result<(), ExecutorError> {
            Ok(())
        }
        fn query_all(&self, _: &str, _: &[SqlValue]) -> Result<Vec<SqlRow>, ExecutorError> {
            Ok(Vec::new())
        }
        fn try_advisory_lock(&self, _: i64) -> Result<bool, ExecutorError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
        fn advisory_unlock(&self, _: i64) -> Result<(), ExecutorError> {
            Ok(())
        }
        fn set_statement_timeout(&self, _: Option<Duration>) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    #[test]
    fn test_polling_inside_a_coroutine() {
        let attempts = Arc::new(AtomicU32::new(0));
        let executor = Contended {
            attempts: Arc::clone(&attempts),
        };

        let handle = may::go!(move || {
            let timed_out = matches!(
                MigrationLockGuard::acquire(
                    &executor,
                    7,
                    Duration::from_millis(100),
                    Duration::from_millis(10),
                ),
                Err(MigrationError::LockTimeout { key: 7, .. })
            );
            (may::coroutine::is_coroutine(), timed_out)
        });

        let (in_coroutine, timed_out) = handle.join().unwrap();
        assert!(in_coroutine);
        assert!(timed_out);
        assert!(attempts.load(Ordering::SeqCst) > 1);
    }
}
