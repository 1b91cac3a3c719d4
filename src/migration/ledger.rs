//! Migration ledger table management
//!
//! The ledger is a bookkeeping table inside the target database with one row
//! per applied migration:
//!
//! | column       | PostgreSQL      | SQLite  |
//! |--------------|-----------------|---------|
//! | `identity`   | `TEXT` PK       | `TEXT` PK |
//! | `serial`     | `BIGINT`        | `INTEGER` |
//! | `applied_at` | `TIMESTAMPTZ`   | `TEXT` (RFC 3339) |
//!
//! All writes go through whatever executor the caller passes in, so when that
//! executor is the run transaction the ledger commits or rolls back together
//! with the migrations themselves.

use crate::executor::{quote_ident, Dialect, SqlValue, TideError, TideExecutor};
use crate::migration::record::LedgerEntry;
use crate::migration::MigrationError;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashSet;

/// Default schema holding the ledger table
pub const DEFAULT_SCHEMA: &str = "public";

/// Default ledger table name
pub const DEFAULT_TABLE: &str = "__migrations";

/// Location of the ledger table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    schema: String,
    table: String,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEMA, DEFAULT_TABLE)
    }
}

impl Ledger {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Build from optional settings, applying the defaults for missing values
    pub fn from_options(schema: Option<&str>, table: Option<&str>) -> Self {
        Self::new(
            schema.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_SCHEMA),
            table.filter(|t| !t.is_empty()).unwrap_or(DEFAULT_TABLE),
        )
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Quoted, schema-qualified table reference for `executor`'s dialect
    pub fn qualified_name(&self, executor: &dyn TideExecutor) -> String {
        executor.dialect().qualify(&self.schema, &self.table)
    }

    /// Whether the ledger table exists
    ///
    /// Reads the catalog only, so it needs no privilege beyond connecting.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::StoreUnavailable` if the catalog cannot be read.
    pub fn exists(&self, executor: &dyn TideExecutor) -> Result<bool, MigrationError> {
        let schema = SqlValue::from(self.schema.as_str());
        let table = SqlValue::from(self.table.as_str());
        let count = match executor.dialect() {
            Dialect::Postgres => self.catalog_count(
                executor,
                "SELECT count(*)::text FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[schema, table],
            )?,
            Dialect::Sqlite => self.catalog_count(
                executor,
                &format!(
                    "SELECT count(*) FROM {}sqlite_master WHERE type = 'table' AND name = ?1",
                    sqlite_catalog_prefix(&self.schema)
                ),
                &[table],
            )?,
        };
        Ok(count > 0)
    }

    /// Create the ledger table (and its schema) if missing
    ///
    /// Idempotent, and issues no DDL when the table is already there. On
    /// PostgreSQL the schema is created first when it does not exist; SQLite
    /// has no schemas, see [`Dialect::qualify`](crate::Dialect::qualify).
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::StoreUnavailable` if the schema or table cannot
    /// be created (insufficient privilege, lost connection, ...).
    pub fn ensure_store(&self, executor: &dyn TideExecutor) -> Result<(), MigrationError> {
        if self.exists(executor)? {
            return Ok(());
        }

        let dialect = executor.dialect();
        let qualified = self.qualified_name(executor);

        if dialect.supports_schemas() && !self.schema_exists(executor)? {
            let sql = format!("CREATE SCHEMA {}", quote_ident(&self.schema));
            executor
                .execute(&sql, &[])
                .map_err(|e| MigrationError::store(format!("creating schema {}", self.schema), e))?;
        }

        let sql = match dialect {
            Dialect::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {qualified} (
                    identity TEXT PRIMARY KEY,
                    serial BIGINT NOT NULL,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            ),
            Dialect::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {qualified} (
                    identity TEXT PRIMARY KEY,
                    serial INTEGER NOT NULL,
                    applied_at TEXT NOT NULL
                )"
            ),
        };
        executor
            .execute(&sql, &[])
            .map_err(|e| MigrationError::store(format!("creating table {qualified}"), e))?;

        log::debug!("created ledger table {qualified}");
        Ok(())
    }

    fn schema_exists(&self, executor: &dyn TideExecutor) -> Result<bool, MigrationError> {
        self.catalog_count(
            executor,
            "SELECT count(*)::text FROM pg_catalog.pg_namespace WHERE nspname = $1",
            &[self.schema.as_str().into()],
        )
        .map(|n| n > 0)
    }

    fn catalog_count(
        &self,
        executor: &dyn TideExecutor,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<i64, MigrationError> {
        let context = || format!("looking up {}.{}", self.schema, self.table);
        let rows = executor
            .query(sql, params)
            .map_err(|e| MigrationError::store(context(), e))?;
        let count = rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().flatten())
            .unwrap_or_default();
        count.parse().map_err(|_| {
            MigrationError::store(
                context(),
                TideError::Parse(format!("expected a row count, got '{count}'")),
            )
        })
    }

    /// Identities of every applied migration
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::StoreUnavailable` if the table cannot be read.
    pub fn load_applied(&self, executor: &dyn TideExecutor) -> Result<HashSet<String>, MigrationError> {
        let qualified = self.qualified_name(executor);
        let sql = format!("SELECT identity FROM {qualified}");

        let rows = executor
            .query(&sql, &[])
            .map_err(|e| MigrationError::store(format!("reading {qualified}"), e))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    /// Every ledger entry, ordered by serial
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::StoreUnavailable` if the table cannot be read
    /// or holds a malformed row.
    pub fn entries(&self, executor: &dyn TideExecutor) -> Result<Vec<LedgerEntry>, MigrationError> {
        let dialect = executor.dialect();
        let qualified = self.qualified_name(executor);
        let sql = format!(
            "SELECT identity, {}, {} FROM {qualified} ORDER BY serial ASC, identity ASC",
            dialect.text_column("serial"),
            dialect.text_column("applied_at"),
        );

        let rows = executor
            .query(&sql, &[])
            .map_err(|e| MigrationError::store(format!("reading {qualified}"), e))?;

        rows.iter()
            .map(|row| {
                LedgerEntry::from_row(row)
                    .map_err(|e| MigrationError::store(format!("decoding {qualified}"), e))
            })
            .collect()
    }

    /// Record one migration as applied, timestamped now
    ///
    /// Must be called on the same transaction as the migration's `up`.
    ///
    /// # Errors
    ///
    /// - `MigrationError::DuplicateEntry` if `identity` is already recorded
    /// - `MigrationError::StoreUnavailable` if the insert fails
    pub fn record_applied(
        &self,
        executor: &dyn TideExecutor,
        identity: &str,
        serial: i64,
    ) -> Result<(), MigrationError> {
        self.record_applied_at(executor, identity, serial, Utc::now())
    }

    /// Record one migration as applied at an explicit time
    ///
    /// # Errors
    ///
    /// See [`record_applied`](Self::record_applied).
    pub fn record_applied_at(
        &self,
        executor: &dyn TideExecutor,
        identity: &str,
        serial: i64,
        applied_at: DateTime<Utc>,
    ) -> Result<(), MigrationError> {
        let dialect = executor.dialect();
        let qualified = self.qualified_name(executor);
        let sql = format!(
            "INSERT INTO {qualified} (identity, serial, applied_at) VALUES ({}, {}, {}) \
             ON CONFLICT (identity) DO NOTHING",
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.timestamp_param(3),
        );

        let inserted = executor
            .execute(
                &sql,
                &[
                    SqlValue::from(identity),
                    SqlValue::Int(serial),
                    SqlValue::Text(applied_at.to_rfc3339_opts(SecondsFormat::Micros, true)),
                ],
            )
            .map_err(|e| MigrationError::store(format!("recording {identity} in {qualified}"), e))?;

        if inserted == 0 {
            return Err(MigrationError::DuplicateEntry {
                identity: identity.to_string(),
            });
        }

        log::debug!("recorded {identity} in {qualified}");
        Ok(())
    }

    /// Remove one migration from the ledger
    ///
    /// Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::StoreUnavailable` if the delete fails.
    pub fn delete_applied(
        &self,
        executor: &dyn TideExecutor,
        identity: &str,
    ) -> Result<bool, MigrationError> {
        let dialect = executor.dialect();
        let qualified = self.qualified_name(executor);
        let sql = format!(
            "DELETE FROM {qualified} WHERE identity = {}",
            dialect.placeholder(1)
        );

        let removed = executor
            .execute(&sql, &[SqlValue::from(identity)])
            .map_err(|e| MigrationError::store(format!("removing {identity} from {qualified}"), e))?;

        if removed == 0 {
            log::warn!("{identity} was not recorded in {qualified}; nothing removed");
        }
        Ok(removed > 0)
    }
}

/// Prefix naming the catalog of an attached SQLite database, empty for `main`
fn sqlite_catalog_prefix(schema: &str) -> String {
    if schema == DEFAULT_SCHEMA || schema == "main" {
        String::new()
    } else {
        format!("{}.", quote_ident(schema))
    }
}
