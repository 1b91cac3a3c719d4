//! Migration settings
//!
//! [`MigrationSettings`] is read from the `[migration]` section of an optional
//! `tidemark.toml`, overlaid with `TIDEMARK__MIGRATION__*` environment
//! variables (e.g. `TIDEMARK__MIGRATION__DATABASE_URL`). Every field has a
//! default, so an empty environment yields a usable value.

use crate::migration::{Ledger, DEFAULT_SCHEMA, DEFAULT_TABLE, DEFAULT_TEMPLATE};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File read by [`MigrationSettings::load`]
pub const DEFAULT_CONFIG_FILE: &str = "tidemark.toml";

const ENV_PREFIX: &str = "TIDEMARK";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Connection string; `sqlite://path` or `sqlite::memory:` selects SQLite
    pub database_url: Option<String>,
    /// Directory holding migration files
    pub migrations_folder: PathBuf,
    /// Scaffold template file; the built-in template is used when unset
    pub migration_template: Option<PathBuf>,
    pub migration_schema: String,
    pub migration_table: String,
    /// Enables the advisory lock when set
    pub lock_timeout_seconds: Option<u64>,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            migrations_folder: PathBuf::from("migrations"),
            migration_template: None,
            migration_schema: DEFAULT_SCHEMA.to_string(),
            migration_table: DEFAULT_TABLE.to_string(),
            lock_timeout_seconds: None,
        }
    }
}

impl MigrationSettings {
    /// Load from `tidemark.toml` in the working directory, falling back to env vars
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load from `path` (optional) plus environment variables
    ///
    /// A file that exists but cannot be parsed is reported with a warning and
    /// ignored; environment variables still apply.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                if path.exists() {
                    log::warn!(
                        "failed to load {}, falling back to env: {err}",
                        path.display()
                    );
                }
                Config::builder()
                    .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {err}, then env-only error: {env_err}"
                        ))
                    })?
            }
        };

        match settings.get::<MigrationSettings>("migration") {
            Ok(loaded) => Ok(loaded),
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            Err(e) => Err(ConfigError::Message(format!(
                "Migration settings could not be loaded from file or environment: {e}"
            ))),
        }
    }

    /// Ledger location described by these settings
    #[must_use]
    pub fn ledger(&self) -> Ledger {
        Ledger::from_options(Some(&self.migration_schema), Some(&self.migration_table))
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_seconds.map(Duration::from_secs)
    }

    /// Scaffold template text
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the configured template file cannot be read.
    pub fn template(&self) -> std::io::Result<String> {
        match &self.migration_template {
            Some(path) => std::fs::read_to_string(path),
            None => Ok(DEFAULT_TEMPLATE.to_string()),
        }
    }
}
