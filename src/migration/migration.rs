//! Migration trait definition

use crate::statements::{split_statements, strip_leading_comments};
use crate::{TideError, TideExecutor};
use once_cell::sync::Lazy;
use regex::Regex;

/// Trait that all migrations must implement
///
/// A migration is identified by its `serial` (the total-order key) and its
/// `identity` (the ledger key). Both are fixed for the life of the value; the
/// engine only ever reads a migration.
///
/// `up` and `down` receive the open transaction as their executor, so
/// everything they do commits or rolls back together with the ledger write.
pub trait Migration {
    /// Ordering key (conventionally a `YYYYMMDDHHMMSS` timestamp)
    fn serial(&self) -> i64;

    /// Ledger key; defaults to the decimal rendering of [`serial`](Self::serial)
    fn identity(&self) -> String {
        self.serial().to_string()
    }

    /// Apply the migration (forward migration)
    fn up(&self, executor: &dyn TideExecutor) -> Result<(), TideError>;

    /// Rollback the migration (reverse migration)
    ///
    /// Optional. Migrations that keep the default cannot be reverted; they can
    /// still be applied.
    ///
    /// **Override [`is_reversible`](Self::is_reversible) together with this
    /// method.** Reverts check `is_reversible` before opening the transaction
    /// and refuse with `Irreversible` when it returns `false`, so a `down`
    /// without it is never called.
    fn down(&self, _executor: &dyn TideExecutor) -> Result<(), TideError> {
        Err(TideError::Other(format!(
            "migration '{}' has no down step",
            self.identity()
        )))
    }

    /// Whether [`down`](Self::down) is implemented; return `true` when overriding it
    fn is_reversible(&self) -> bool {
        false
    }

    /// First statement that cannot run inside a transaction block, if any
    ///
    /// Such migrations are refused before the run transaction is opened.
    fn non_transactional_statement(&self) -> Option<String> {
        None
    }
}

macro_rules! forward_migration {
    ($ty:ty) => {
        impl<M: Migration + ?Sized> Migration for $ty {
            fn serial(&self) -> i64 {
                (**self).serial()
            }

            fn identity(&self) -> String {
                (**self).identity()
            }

            fn up(&self, executor: &dyn TideExecutor) -> Result<(), TideError> {
                (**self).up(executor)
            }

            fn down(&self, executor: &dyn TideExecutor) -> Result<(), TideError> {
                (**self).down(executor)
            }

            fn is_reversible(&self) -> bool {
                (**self).is_reversible()
            }

            fn non_transactional_statement(&self) -> Option<String> {
                (**self).non_transactional_statement()
            }
        }
    };
}

forward_migration!(&M);
forward_migration!(Box<M>);

/// Statements PostgreSQL refuses to run inside a transaction block, plus
/// explicit transaction control
static NON_TRANSACTIONAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)^(BEGIN|START\s+TRANSACTION|COMMIT|END|ROLLBACK|ABORT|SAVEPOINT|RELEASE|PREPARE\s+TRANSACTION|VACUUM|(CREATE|DROP)\s+DATABASE|(CREATE|DROP)\s+TABLESPACE|ALTER\s+SYSTEM|(CREATE\s+(UNIQUE\s+)?|DROP\s+)INDEX\s+CONCURRENTLY|REINDEX\s+.*\bCONCURRENTLY)\b",
    )
    .unwrap_or_else(|e| unreachable!("non-transactional pattern is valid: {e}"))
});

/// Find the first statement of `script` that cannot run in a transaction
#[must_use]
pub fn find_non_transactional(script: &str) -> Option<String> {
    split_statements(script)
        .into_iter()
        .map(strip_leading_comments)
        .find(|statement| NON_TRANSACTIONAL.is_match(statement))
        .map(|statement| statement.lines().next().unwrap_or(statement).trim().to_string())
}

/// A migration whose up/down logic is a SQL script
///
/// # Examples
///
/// ```
/// use tidemark::migration::{Migration, SqlMigration};
///
/// let m = SqlMigration::new(20240120120000, "CREATE TABLE users (id BIGINT PRIMARY KEY)")
///     .with_down("DROP TABLE users");
/// assert_eq!(m.identity(), "20240120120000");
/// assert!(m.is_reversible());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlMigration {
    serial: i64,
    identity: String,
    up: String,
    down: Option<String>,
}

impl SqlMigration {
    /// Create a migration whose identity is its serial
    pub fn new(serial: i64, up: impl Into<String>) -> Self {
        Self {
            serial,
            identity: serial.to_string(),
            up: up.into(),
            down: None,
        }
    }

    /// Override the ledger identity
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Attach an inverse script
    #[must_use]
    pub fn with_down(mut self, down: impl Into<String>) -> Self {
        self.down = Some(down.into());
        self
    }

    /// Forward script
    pub fn up_sql(&self) -> &str {
        &self.up
    }

    /// Inverse script, if any
    pub fn down_sql(&self) -> Option<&str> {
        self.down.as_deref()
    }
}

impl Migration for SqlMigration {
    fn serial(&self) -> i64 {
        self.serial
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn up(&self, executor: &dyn TideExecutor) -> Result<(), TideError> {
        executor.batch_execute(&self.up)
    }

    fn down(&self, executor: &dyn TideExecutor) -> Result<(), TideError> {
        match &self.down {
            Some(script) => executor.batch_execute(script),
            None => Err(TideError::Other(format!(
                "migration '{}' has no down step",
                self.identity
            ))),
        }
    }

    fn is_reversible(&self) -> bool {
        self.down.is_some()
    }

    fn non_transactional_statement(&self) -> Option<String> {
        find_non_transactional(&self.up)
    }
}
