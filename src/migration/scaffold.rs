//! Migration scaffold generator
//!
//! Writes a new, empty migration file named after a fresh serial. Serials are
//! UTC timestamps of the form `YYYYMMDDHHMMSS`, so files sort chronologically.

use crate::migration::MigrationError;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File name suffix used when none is configured
pub const DEFAULT_SUFFIX: &str = ".migration.sql";

/// Template used when none is configured
pub const DEFAULT_TEMPLATE: &str = "-- Migration {{serial}}
-- Created at {{timestamp}}

-- migrate:up


-- migrate:down

";

static SERIAL_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*serial\s*\}\}")
        .unwrap_or_else(|e| unreachable!("serial placeholder pattern is valid: {e}"))
});

static TIMESTAMP_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*timestamp\s*\}\}")
        .unwrap_or_else(|e| unreachable!("timestamp placeholder pattern is valid: {e}"))
});

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// `YYYYMMDDHHMMSS` serial for `at`
#[must_use]
pub fn serial_for(at: DateTime<Utc>) -> i64 {
    // Every component is a fixed-width decimal, so the rendering always parses.
    at.format("%Y%m%d%H%M%S")
        .to_string()
        .parse()
        .unwrap_or_default()
}

/// Substitute `{{serial}}` and `{{timestamp}}` in `template`
#[must_use]
pub fn render_template(template: &str, serial: i64, at: DateTime<Utc>) -> String {
    let serial = serial.to_string();
    let timestamp = at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let rendered = SERIAL_PLACEHOLDER.replace_all(template, serial.as_str());
    TIMESTAMP_PLACEHOLDER
        .replace_all(&rendered, timestamp.as_str())
        .into_owned()
}

/// Creates migration files with strictly increasing serials
pub struct ScaffoldGenerator {
    clock: Box<dyn Clock>,
    suffix: String,
    last_serial: Mutex<Option<i64>>,
}

impl Default for ScaffoldGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScaffoldGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScaffoldGenerator")
            .field("suffix", &self.suffix)
            .finish_non_exhaustive()
    }
}

impl ScaffoldGenerator {
    /// Generator using the system clock and [`DEFAULT_SUFFIX`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: Box::new(SystemClock),
            suffix: DEFAULT_SUFFIX.to_string(),
            last_serial: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Next serial: the clock's, bumped past the last one handed out
    fn next_serial(&self, at: DateTime<Utc>) -> i64 {
        let mut last = self
            .last_serial
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let candidate = serial_for(at);
        let serial = match *last {
            Some(prev) if candidate <= prev => prev + 1,
            _ => candidate,
        };
        *last = Some(serial);
        serial
    }

    /// Write a new migration file into `target_dir`
    ///
    /// `target_dir` is created if missing. An existing file is never
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::ScaffoldWriteFailed` if the directory cannot be
    /// created, the file already exists, or writing fails.
    pub fn create(&self, target_dir: &Path, template: &str) -> Result<PathBuf, MigrationError> {
        let at = self.clock.now();
        let serial = self.next_serial(at);

        fs::create_dir_all(target_dir).map_err(|source| MigrationError::ScaffoldWriteFailed {
            path: target_dir.to_path_buf(),
            source,
        })?;

        let path = target_dir.join(format!("{serial}{}", self.suffix));
        let contents = render_template(template, serial, at);

        write_new_file(&path, |file| {
            file.write_all(contents.as_bytes())?;
            file.sync_all()
        })
        .map_err(|source| MigrationError::ScaffoldWriteFailed {
            path: path.clone(),
            source,
        })?;

        log::info!("created migration {}", path.display());
        Ok(path)
    }
}

/// Create `path` (never overwriting) and fill it with `write`
///
/// A file this call created is removed again if `write` fails, so a retry does
/// not collide with a half-written scaffold.
fn write_new_file<F>(path: &Path, write: F) -> std::io::Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = write(&mut file) {
        drop(file);
        if let Err(cleanup) = fs::remove_file(path) {
            log::warn!("could not remove partial scaffold {}: {cleanup}", path.display());
        }
        return Err(e);
    }
    Ok(())
}
