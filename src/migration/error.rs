//! Migration-specific error types

use crate::migration::outcome::RunOutcome;
use crate::TideError;
use std::path::PathBuf;

/// Migration-specific errors
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The ledger table could not be created, read or written
    #[error("Migration ledger unavailable ({context}): {source}")]
    StoreUnavailable {
        context: String,
        #[source]
        source: TideError,
    },

    /// Duplicate or unsorted serials/identities in the supplied migration set
    #[error("Invalid migration set: {0}")]
    InvalidMigrationSet(String),

    /// The ledger already holds this identity
    #[error("Migration '{identity}' is already recorded in the ledger")]
    DuplicateEntry { identity: String },

    /// A migration's forward logic failed
    #[error("Migration '{identity}' (serial {serial}) failed to apply: {source}")]
    ApplyFailed {
        identity: String,
        serial: i64,
        #[source]
        source: TideError,
    },

    /// A migration's inverse logic failed
    #[error("Migration '{identity}' (serial {serial}) failed to revert: {source}")]
    RevertFailed {
        identity: String,
        serial: i64,
        #[source]
        source: TideError,
    },

    /// A migration needs to run outside a transaction, which is unsupported
    #[error(
        "Migration '{identity}' cannot run inside a transaction ({statement}). \
         Non-transactional migrations are not supported; move the statement to a separate deployment step"
    )]
    NonTransactional { identity: String, statement: String },

    /// `ROLLBACK` failed; the database may be inconsistent
    ///
    /// `cause` is the error that triggered the rollback, absent for a dry run.
    #[error(
        "Rollback failed{}: {source}\n\
         The database may have been left partially migrated; inspect it manually",
        .cause.as_ref().map(|c| format!(" after error [{c}]")).unwrap_or_default()
    )]
    RollbackFailed {
        cause: Option<Box<MigrationError>>,
        #[source]
        source: TideError,
    },

    /// `COMMIT` itself failed
    #[error("Commit failed: {0}")]
    CommitFailed(#[source] TideError),

    /// The run was cancelled by the caller
    #[error("Migration run cancelled")]
    Cancelled,

    /// The migration has no inverse logic
    #[error("Migration '{identity}' cannot be reverted: it has no down step")]
    Irreversible { identity: String },

    /// A ledger identity has no matching migration definition
    #[error("Migration '{identity}' is recorded in the ledger but no definition for it was supplied")]
    UnknownMigration { identity: String },

    /// Migration lock timeout
    #[error(
        "Migration lock timeout: {0}\n\
         Another process may be running migrations"
    )]
    LockTimeout(String),

    /// The scaffold could not be written
    #[error("Failed to write migration scaffold {}: {source}", .path.display())]
    ScaffoldWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MigrationError {
    /// Whether every change made by the failed run is known to be undone
    ///
    /// `false` for `RollbackFailed`, and for `CommitFailed`, whose effect on the
    /// server is unknown.
    #[must_use]
    pub fn changes_reverted(&self) -> bool {
        !matches!(
            self,
            MigrationError::RollbackFailed { .. } | MigrationError::CommitFailed(_)
        )
    }

    /// Identity of the migration that caused the error, if any
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        match self {
            MigrationError::DuplicateEntry { identity }
            | MigrationError::ApplyFailed { identity, .. }
            | MigrationError::RevertFailed { identity, .. }
            | MigrationError::NonTransactional { identity, .. }
            | MigrationError::Irreversible { identity }
            | MigrationError::UnknownMigration { identity } => Some(identity.as_str()),
            MigrationError::RollbackFailed { cause, .. } => cause.as_deref().and_then(MigrationError::identity),
            _ => None,
        }
    }

    pub(crate) fn store(context: impl Into<String>, source: TideError) -> Self {
        MigrationError::StoreUnavailable {
            context: context.into(),
            source,
        }
    }
}

/// A failed run: the error plus what was attempted before it
///
/// The outcome never reports `committed = true`.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunFailure {
    pub error: MigrationError,
    pub outcome: RunOutcome,
}

impl RunFailure {
    /// A failure that happened before any migration was attempted
    #[must_use]
    pub fn before_run(error: MigrationError, dry_run: bool) -> Self {
        Self {
            error,
            outcome: RunOutcome::empty(false, dry_run),
        }
    }

    /// Consume the failure, keeping only the error
    #[must_use]
    pub fn into_error(self) -> MigrationError {
        self.error
    }
}

impl From<RunFailure> for MigrationError {
    fn from(failure: RunFailure) -> Self {
        failure.error
    }
}
