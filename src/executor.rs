//! `TideExecutor` Module
//!
//! Provides the `TideExecutor` trait that abstracts statement execution over the
//! supported database backends.
//!
//! The migration engine only ever talks to a database through this trait, so the
//! ledger, the transaction coordinator and individual migrations work the same
//! against PostgreSQL (`may_postgres`) and SQLite (`rusqlite`).

use may_postgres::types::ToSql;
use may_postgres::Client;
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

/// `TideExecutor` error type
#[derive(Debug, thiserror::Error)]
pub enum TideError {
    /// `PostgreSQL` error from `may_postgres`
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] may_postgres::Error),
    /// `SQLite` error from `rusqlite`
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Query execution error
    #[error("Query error: {0}")]
    Query(String),
    /// Row parsing/conversion error
    #[error("Parse error: {0}")]
    Parse(String),
    /// Statement issued on a transaction that was already committed or rolled back
    #[error("Transaction has already been committed or rolled back")]
    TransactionClosed,
    /// Transaction control statement issued inside a managed transaction
    #[error("Transaction control statement is not allowed inside a migration: {0}")]
    TransactionControl(String),
    /// Other execution errors
    #[error("Execution error: {0}")]
    Other(String),
}

/// A positional statement parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

/// A result row with every column decoded to text (`None` for SQL `NULL`)
pub type TextRow = Vec<Option<String>>;

/// SQL dialect of the connected backend
///
/// Only the handful of differences the ledger and lock need are modelled here;
/// migration bodies are written against their target backend directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Positional placeholder for the `n`th (1-based) parameter
    #[must_use]
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::Sqlite => format!("?{n}"),
        }
    }

    /// Placeholder for a timestamp bound as RFC 3339 text
    #[must_use]
    pub fn timestamp_param(self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}::text::timestamptz"),
            Dialect::Sqlite => format!("?{n}"),
        }
    }

    /// Select expression that yields `column` as text
    #[must_use]
    pub fn text_column(self, column: &str) -> String {
        match self {
            Dialect::Postgres => format!("{column}::text"),
            Dialect::Sqlite => column.to_string(),
        }
    }

    /// Whether `CREATE SCHEMA` is meaningful for this backend
    #[must_use]
    pub fn supports_schemas(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Fully qualified, quoted table reference
    ///
    /// SQLite has no schemas: `public` and `main` resolve to the main database,
    /// any other name must be an attached database.
    #[must_use]
    pub fn qualify(self, schema: &str, table: &str) -> String {
        match self {
            Dialect::Postgres => format!("{}.{}", quote_ident(schema), quote_ident(table)),
            Dialect::Sqlite if schema == "public" || schema == "main" => quote_ident(table),
            Dialect::Sqlite => format!("{}.{}", quote_ident(schema), quote_ident(table)),
        }
    }
}

/// Quote an identifier, doubling any embedded quote characters
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Trait for executing database statements
///
/// This trait abstracts statement execution, allowing a direct client, an
/// embedded database, or an open [`Transaction`](crate::transaction::Transaction)
/// to be used interchangeably.
///
/// # Examples
///
/// ```no_run
/// use tidemark::{SqliteExecutor, TideExecutor, SqlValue};
///
/// # fn main() -> Result<(), tidemark::TideError> {
/// let executor = SqliteExecutor::in_memory()?;
/// executor.batch_execute("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)")?;
///
/// let sql = format!(
///     "INSERT INTO users (email) VALUES ({})",
///     executor.dialect().placeholder(1)
/// );
/// executor.execute(&sql, &[SqlValue::from("a@example.com")])?;
///
/// let rows = executor.query("SELECT email FROM users", &[])?;
/// assert_eq!(rows[0][0].as_deref(), Some("a@example.com"));
/// # Ok(())
/// # }
/// ```
pub trait TideExecutor {
    /// SQL dialect spoken by this executor
    fn dialect(&self) -> Dialect;

    /// Execute one statement and return the number of rows affected
    ///
    /// # Errors
    ///
    /// Returns `TideError` if the statement fails.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, TideError>;

    /// Execute one or more `;`-separated statements without parameters
    ///
    /// # Errors
    ///
    /// Returns `TideError` if any statement fails; later statements are not run.
    fn batch_execute(&self, sql: &str) -> Result<(), TideError>;

    /// Execute a query and return all rows, every column decoded to text
    ///
    /// # Errors
    ///
    /// Returns `TideError` if the query fails or a column cannot be decoded.
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<TextRow>, TideError>;
}

impl<T: TideExecutor + ?Sized> TideExecutor for &T {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, TideError> {
        (**self).execute(sql, params)
    }

    fn batch_execute(&self, sql: &str) -> Result<(), TideError> {
        (**self).batch_execute(sql)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<TextRow>, TideError> {
        (**self).query(sql, params)
    }
}

/// Executor implementation for `may_postgres::Client`
pub struct MayPostgresExecutor {
    client: Client,
}

impl MayPostgresExecutor {
    /// Create a new executor from a `may_postgres` client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get a reference to the underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Consume the executor and return the underlying client
    pub fn into_client(self) -> Client {
        self.client
    }
}

/// Borrow `SqlValue`s as `may_postgres` parameters
fn postgres_params<'a>(params: &'a [SqlValue], null: &'a Option<String>) -> Vec<&'a dyn ToSql> {
    params
        .iter()
        .map(|value| match value {
            SqlValue::Null => null as &dyn ToSql,
            SqlValue::Bool(b) => b as &dyn ToSql,
            SqlValue::Int(i) => i as &dyn ToSql,
            SqlValue::Text(s) => s as &dyn ToSql,
        })
        .collect()
}

impl TideExecutor for MayPostgresExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, TideError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(sql).entered();

        let start = Instant::now();
        let null: Option<String> = None;
        let bound = postgres_params(params, &null);
        let result = self.client.execute(sql, &bound).map_err(TideError::from);
        log::trace!("statement finished in {:?}", start.elapsed());
        result
    }

    fn batch_execute(&self, sql: &str) -> Result<(), TideError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(sql).entered();

        self.client.batch_execute(sql).map_err(TideError::from)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<TextRow>, TideError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(sql).entered();

        let null: Option<String> = None;
        let bound = postgres_params(params, &null);
        let rows = self.client.query(sql, &bound)?;

        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut columns = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                let value: Option<String> = row.try_get(idx).map_err(|e| {
                    TideError::Parse(format!(
                        "column {idx} is not text (cast it with ::text in the query): {e}"
                    ))
                })?;
                columns.push(value);
            }
            decoded.push(columns);
        }
        Ok(decoded)
    }
}
