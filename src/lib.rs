//! # Tidemark
//!
//! Transactional schema migrations for PostgreSQL (`may_postgres`) and SQLite.
//!
//! A run applies every pending migration inside a single transaction together
//! with its ledger entry, so it either commits as a whole or leaves the
//! database untouched. A damp run (`commit = false`) applies everything and
//! rolls it back, validating the batch against the real schema.

pub mod config;
pub mod connection;
pub mod executor;
pub mod migration;
pub mod sqlite;
pub mod statements;
pub mod transaction;

#[cfg(feature = "tracing")]
mod tracing_helpers;

pub use config::MigrationSettings;
pub use connection::{connect, open_executor, ConnectionError};
pub use executor::{Dialect, MayPostgresExecutor, SqlValue, TextRow, TideError, TideExecutor};
pub use sqlite::SqliteExecutor;
