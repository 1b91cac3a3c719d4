//! SQLite executor backed by `rusqlite`

use crate::executor::{Dialect, SqlValue, TextRow, TideError, TideExecutor};
use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;
use std::path::Path;

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

/// Executor implementation for a `rusqlite::Connection`
pub struct SqliteExecutor {
    conn: Connection,
}

impl SqliteExecutor {
    /// Open (or create) a database file
    ///
    /// # Errors
    ///
    /// Returns `TideError::Sqlite` if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, TideError> {
        log::info!("opening sqlite database at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Open a private in-memory database
    ///
    /// # Errors
    ///
    /// Returns `TideError::Sqlite` if the database cannot be created.
    pub fn in_memory() -> Result<Self, TideError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn sqlite_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
        SqlValue::Int(i) => Value::Integer(*i),
        SqlValue::Text(s) => Value::Text(s.clone()),
    }
}

fn text_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Some(bytes.iter().map(|b| format!("{b:02x}")).collect()),
    }
}

impl TideExecutor for SqliteExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, TideError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(sql).entered();

        let affected = self
            .conn
            .execute(sql, rusqlite::params_from_iter(params.iter().map(sqlite_value)))?;
        Ok(affected as u64)
    }

    fn batch_execute(&self, sql: &str) -> Result<(), TideError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(sql).entered();

        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<TextRow>, TideError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(sql).entered();

        let mut stmt = self.conn.prepare(sql)?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(sqlite_value)))?;

        let mut decoded = Vec::new();
        while let Some(row) = rows.next()? {
            let mut columns = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                columns.push(text_value(row.get_ref(idx)?));
            }
            decoded.push(columns);
        }
        Ok(decoded)
    }
}
