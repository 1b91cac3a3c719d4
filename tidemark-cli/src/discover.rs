//! Migration file discovery and parsing

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tidemark::migration::SqlMigration;
use tidemark::statements::split_statements;

/// `{serial}.migration.sql` (scaffold output) or `{serial}_{name}.sql`
static FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)(?:\.migration|_([^.]+))\.sql$")
        .unwrap_or_else(|e| unreachable!("filename pattern is valid: {e}"))
});

/// `-- migrate:up` / `-- migrate:down` section markers, each on its own line
static SECTION_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^[ \t]*--[ \t]*migrate:(up|down)[ \t]*\r?$")
        .unwrap_or_else(|e| unreachable!("section marker pattern is valid: {e}"))
});

/// Errors raised while reading the migrations folder
#[derive(Debug, thiserror::Error)]
pub enum DiscoverError {
    #[error("Migrations directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("Failed to read {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration file name '{0}' has a serial that does not fit in 64 bits")]
    InvalidSerial(String),
}

/// A discovered migration file
#[derive(Debug, Clone)]
pub struct MigrationFile {
    pub path: PathBuf,
    pub serial: i64,
    /// Descriptive part of `{serial}_{name}.sql`
    pub name: Option<String>,
    pub migration: SqlMigration,
}

/// Extract the serial and optional name from a migration file name
///
/// Returns `Ok(None)` for files that are not migrations.
///
/// # Example
/// - `20240120120000.migration.sql` → (20240120120000, None)
/// - `20240120120000_create_users.sql` → (20240120120000, Some("create_users"))
pub fn parse_filename(filename: &str) -> Result<Option<(i64, Option<String>)>, DiscoverError> {
    let Some(caps) = FILENAME.captures(filename) else {
        return Ok(None);
    };
    let serial = caps[1]
        .parse::<i64>()
        .map_err(|_| DiscoverError::InvalidSerial(filename.to_string()))?;
    let name = caps.get(2).map(|m| m.as_str().to_string());
    Ok(Some((serial, name)))
}

/// Split a migration script into its up and down parts
///
/// Without markers the whole script is the up part. Text before the first
/// marker is ignored when markers are present. A down part holding no
/// statements counts as absent.
#[must_use]
pub fn parse_script(contents: &str) -> (String, Option<String>) {
    let markers: Vec<_> = SECTION_MARKER.captures_iter(contents).collect();
    if markers.is_empty() {
        return (contents.trim().to_string(), None);
    }

    let mut up = String::new();
    let mut down = String::new();
    for (idx, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(kind)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = markers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map_or(contents.len(), |m| m.start());
        let body = contents[whole.end()..end].trim();
        let target = if kind.as_str().eq_ignore_ascii_case("up") {
            &mut up
        } else {
            &mut down
        };
        if !body.is_empty() {
            if !target.is_empty() {
                target.push('\n');
            }
            target.push_str(body);
        }
    }

    let down = (!split_statements(&down).is_empty()).then_some(down);
    (up, down)
}

/// Discover all migration files in `dir`, sorted by serial
///
/// Files whose names do not look like migrations are skipped. Duplicate serials
/// are returned as found; the engine rejects them.
///
/// # Errors
///
/// Returns `DiscoverError` if the directory or a file cannot be read.
pub fn discover_migrations(dir: &Path) -> Result<Vec<MigrationFile>, DiscoverError> {
    if !dir.is_dir() {
        return Err(DiscoverError::DirectoryNotFound(dir.to_path_buf()));
    }

    let unreadable = |path: &Path| {
        let path = path.to_path_buf();
        move |source| DiscoverError::Unreadable { path, source }
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(unreadable(dir))? {
        let path = entry.map_err(unreadable(dir))?.path();
        if !path.is_file() {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((serial, name)) = parse_filename(filename)? else {
            log::debug!("skipping {filename}: not a migration file");
            continue;
        };

        let contents = fs::read_to_string(&path).map_err(unreadable(&path))?;
        let (up, down) = parse_script(&contents);
        if split_statements(&up).is_empty() {
            log::warn!("{filename} has no up statements");
        }

        let mut migration = SqlMigration::new(serial, up);
        if let Some(down) = down {
            migration = migration.with_down(down);
        }
        files.push(MigrationFile {
            path,
            serial,
            name,
            migration,
        });
    }

    files.sort_by(|a, b| a.serial.cmp(&b.serial).then_with(|| a.path.cmp(&b.path)));
    log::debug!("discovered {} migration(s) in {}", files.len(), dir.display());
    Ok(files)
}
