//! Advisory lock serializing migration runs against one ledger

use crate::executor::{Dialect, SqlValue, TideExecutor};
use crate::migration::ledger::Ledger;
use crate::migration::MigrationError;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

/// Delay between lock attempts
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock guard that automatically releases the lock when dropped
///
/// On PostgreSQL this holds a session-level advisory lock keyed by the ledger's
/// `schema.table`, so two runners pointed at the same ledger serialize while
/// runners on different ledgers do not block each other. Session locks survive
/// the run transaction's rollback and are released by the guard.
///
/// On SQLite the guard is a no-op; the database file lock already serializes
/// writers.
pub struct MigrationLockGuard<'a> {
    executor: &'a dyn TideExecutor,
    key: Option<i64>,
}

impl<'a> MigrationLockGuard<'a> {
    /// Acquire the lock, polling until `timeout` elapses
    ///
    /// # Errors
    ///
    /// - `MigrationError::LockTimeout` if another session holds the lock for
    ///   longer than `timeout`
    /// - `MigrationError::StoreUnavailable` if the lock query itself fails
    pub fn acquire(
        executor: &'a dyn TideExecutor,
        ledger: &Ledger,
        timeout: Duration,
    ) -> Result<Self, MigrationError> {
        if executor.dialect() != Dialect::Postgres {
            log::debug!("advisory locks are not used on {:?}", executor.dialect());
            return Ok(Self {
                executor,
                key: None,
            });
        }

        let key = lock_key(ledger);
        let start = Instant::now();
        loop {
            let rows = executor
                .query(
                    "SELECT pg_try_advisory_lock($1)::text",
                    &[SqlValue::Int(key)],
                )
                .map_err(|e| MigrationError::store("acquiring migration lock", e))?;

            let acquired = rows
                .first()
                .and_then(|row| row.first())
                .and_then(Option::as_deref)
                == Some("true");
            if acquired {
                log::debug!("acquired migration lock {key}");
                return Ok(Self {
                    executor,
                    key: Some(key),
                });
            }

            if start.elapsed() >= timeout {
                return Err(MigrationError::LockTimeout(format!(
                    "Failed to acquire the lock for {}.{} within {} seconds",
                    ledger.schema(),
                    ledger.table(),
                    timeout.as_secs()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Whether an advisory lock is actually held
    pub fn is_held(&self) -> bool {
        self.key.is_some()
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        let Some(key) = self.key else {
            return;
        };
        match self
            .executor
            .query("SELECT pg_advisory_unlock($1)::text", &[SqlValue::Int(key)])
        {
            Ok(_) => log::debug!("released migration lock {key}"),
            Err(e) => log::error!("failed to release migration lock {key}: {e}"),
        }
    }
}

/// 64-bit advisory lock key derived from the ledger location
pub fn lock_key(ledger: &Ledger) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(ledger.schema().as_bytes());
    hasher.update(b".");
    hasher.update(ledger.table().as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
