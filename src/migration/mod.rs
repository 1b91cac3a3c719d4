//! Transactional schema migrations
//!
//! This module provides:
//! - the [`Migration`] trait and the script-backed [`SqlMigration`]
//! - the [`Ledger`] table recording which migrations are applied
//! - the [`TransactionCoordinator`] that applies a batch in one transaction
//! - the [`Migrator`] front end (`execute`, `status`, `revert`)
//! - the [`ScaffoldGenerator`] for new migration files
//!
//! # Example
//!
//! ```rust,no_run
//! use tidemark::migration::{Ledger, Migration, Migrator};
//! use tidemark::{SqliteExecutor, TideError, TideExecutor};
//!
//! pub struct CreateUsersTable;
//!
//! impl Migration for CreateUsersTable {
//!     fn serial(&self) -> i64 {
//!         20240120120000
//!     }
//!
//!     fn up(&self, executor: &dyn TideExecutor) -> Result<(), TideError> {
//!         executor.batch_execute(
//!             "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE)",
//!         )
//!     }
//!
//!     fn down(&self, executor: &dyn TideExecutor) -> Result<(), TideError> {
//!         executor.batch_execute("DROP TABLE users")
//!     }
//!
//!     fn is_reversible(&self) -> bool {
//!         true
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = SqliteExecutor::in_memory()?;
//! let migrations: Vec<Box<dyn Migration>> = vec![Box::new(CreateUsersTable)];
//!
//! // Damp run: apply, then roll everything back
//! Migrator::new(Ledger::default()).execute(&db, &migrations, false)?;
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod lock;
#[allow(clippy::module_inception)]
pub mod migration;
pub mod migrator;
pub mod outcome;
pub mod record;
pub mod scaffold;
pub mod status;

pub use coordinator::{CancelFlag, TransactionCoordinator};
pub use error::{MigrationError, RunFailure};
pub use ledger::{Ledger, DEFAULT_SCHEMA, DEFAULT_TABLE};
pub use lock::MigrationLockGuard;
pub use migration::{find_non_transactional, Migration, SqlMigration};
pub use migrator::Migrator;
pub use outcome::{RunOutcome, StepOutcome, StepStatus};
pub use record::LedgerEntry;
pub use scaffold::{Clock, ScaffoldGenerator, SystemClock, DEFAULT_SUFFIX, DEFAULT_TEMPLATE};
pub use status::{MigrationStatus, PendingMigration};
