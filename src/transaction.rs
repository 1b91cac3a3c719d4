//! Transaction Module
//!
//! Wraps an executor in an explicit `BEGIN` / `COMMIT` / `ROLLBACK` boundary.
//!
//! A [`Transaction`] is itself a [`TideExecutor`], so migration code runs against
//! it exactly as it would against a plain connection. Two rules are enforced on
//! statements issued through it:
//!
//! - transaction control (`BEGIN`, `COMMIT`, `ROLLBACK`, `SAVEPOINT`, ...) is
//!   refused, since it would silently end or nest the managed transaction;
//! - once committed or rolled back, the handle refuses all further statements.
//!
//! A transaction dropped while still open is rolled back.

use crate::executor::{Dialect, SqlValue, TextRow, TideError, TideExecutor};
use crate::statements::{split_statements, strip_leading_comments};
use once_cell::sync::Lazy;
use regex::Regex;

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

/// Statements that open, close or nest a transaction
static TRANSACTION_CONTROL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(BEGIN|START\s+TRANSACTION|COMMIT|END|ROLLBACK|ABORT|SAVEPOINT|RELEASE|PREPARE\s+TRANSACTION)\b",
    )
    .unwrap_or_else(|e| unreachable!("transaction control pattern is valid: {e}"))
});

/// Return the offending keyword if `statement` is transaction control
pub fn transaction_control_keyword(statement: &str) -> Option<String> {
    TRANSACTION_CONTROL
        .captures(strip_leading_comments(statement))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_uppercase())
}

/// A database transaction over a borrowed executor
///
/// # Examples
///
/// ```no_run
/// use tidemark::{SqliteExecutor, TideExecutor};
/// use tidemark::transaction::Transaction;
///
/// # fn main() -> Result<(), tidemark::TideError> {
/// let executor = SqliteExecutor::in_memory()?;
/// let tx = Transaction::begin(&executor)?;
/// tx.batch_execute("CREATE TABLE users (id INTEGER PRIMARY KEY)")?;
/// tx.rollback()?;
/// # Ok(())
/// # }
/// ```
pub struct Transaction<'a> {
    executor: &'a dyn TideExecutor,
    closed: bool,
}

impl<'a> Transaction<'a> {
    /// Start a new transaction on `executor`
    ///
    /// # Errors
    ///
    /// Returns `TideError` if `BEGIN` fails.
    pub fn begin(executor: &'a dyn TideExecutor) -> Result<Self, TideError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        executor.execute("BEGIN", &[])?;
        log::debug!("transaction started");

        Ok(Self {
            executor,
            closed: false,
        })
    }

    /// Commit the transaction
    ///
    /// # Errors
    ///
    /// Returns `TideError` if `COMMIT` fails. The transaction counts as closed
    /// either way; a failed `COMMIT` leaves nothing to roll back.
    pub fn commit(mut self) -> Result<(), TideError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span().entered();

        self.closed = true;
        self.executor.execute("COMMIT", &[])?;
        log::debug!("transaction committed");
        Ok(())
    }

    /// Roll back the transaction, discarding every change made through it
    ///
    /// # Errors
    ///
    /// Returns `TideError` if `ROLLBACK` fails.
    pub fn rollback(mut self) -> Result<(), TideError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span().entered();

        self.closed = true;
        self.executor.execute("ROLLBACK", &[])?;
        log::debug!("transaction rolled back");
        Ok(())
    }

    /// Check if the transaction is closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn guard(&self, sql: &str) -> Result<(), TideError> {
        if self.closed {
            return Err(TideError::TransactionClosed);
        }
        if let Some(keyword) = transaction_control_keyword(sql) {
            return Err(TideError::TransactionControl(keyword));
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        log::warn!("transaction dropped while open, rolling back");
        if let Err(e) = self.executor.execute("ROLLBACK", &[]) {
            log::error!("rollback of abandoned transaction failed: {e}");
        }
    }
}

impl TideExecutor for Transaction<'_> {
    fn dialect(&self) -> Dialect {
        self.executor.dialect()
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, TideError> {
        self.guard(sql)?;
        self.executor.execute(sql, params)
    }

    fn batch_execute(&self, sql: &str) -> Result<(), TideError> {
        if self.closed {
            return Err(TideError::TransactionClosed);
        }
        for statement in split_statements(sql) {
            if let Some(keyword) = transaction_control_keyword(statement) {
                return Err(TideError::TransactionControl(keyword));
            }
        }
        self.executor.batch_execute(sql)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<TextRow>, TideError> {
        self.guard(sql)?;
        self.executor.query(sql, params)
    }
}
