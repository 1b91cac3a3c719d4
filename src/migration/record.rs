//! `LedgerEntry` - one row of the migration ledger table

use crate::executor::TextRow;
use crate::TideError;
use chrono::{DateTime, NaiveDateTime, Utc};

/// A migration recorded as applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Ledger key of the migration
    pub identity: String,

    /// Ordering key the migration had when it was applied
    pub serial: i64,

    /// When the migration was applied
    pub applied_at: DateTime<Utc>,
}

impl LedgerEntry {
    #[must_use]
    pub fn new(identity: String, serial: i64, applied_at: DateTime<Utc>) -> Self {
        Self {
            identity,
            serial,
            applied_at,
        }
    }

    /// Build an entry from a ledger row
    ///
    /// Expected column order: `identity`, `serial`, `applied_at` (all as text)
    ///
    /// # Errors
    ///
    /// Returns `TideError::Parse` if a column is missing or malformed.
    pub fn from_row(row: &TextRow) -> Result<Self, TideError> {
        let column = |idx: usize, name: &str| {
            row.get(idx)
                .and_then(Option::as_deref)
                .ok_or_else(|| TideError::Parse(format!("ledger row is missing `{name}`")))
        };

        let identity = column(0, "identity")?.to_string();
        let serial_str = column(1, "serial")?;
        let serial = serial_str.trim().parse::<i64>().map_err(|e| {
            TideError::Parse(format!("ledger serial '{serial_str}' is not an integer: {e}"))
        })?;
        let applied_at = parse_timestamp(column(2, "applied_at")?)?;

        Ok(Self {
            identity,
            serial,
            applied_at,
        })
    }
}

/// Parse a timestamp as stored by either backend
///
/// SQLite rows hold RFC 3339 text written by the ledger; PostgreSQL renders
/// `timestamptz::text` as `YYYY-MM-DD HH:MM:SS[.ffffff]+HH[:MM]`.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TideError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(dt.with_timezone(&Utc));
    }
    // Offset-less forms are taken as UTC
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(TideError::Parse(format!(
        "Failed to parse timestamp '{raw}': unrecognized format"
    )))
}
