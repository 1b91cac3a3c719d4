//! Migrator - Core migration execution engine

use crate::executor::TideExecutor;
use crate::migration::coordinator::{CancelFlag, TransactionCoordinator};
use crate::migration::error::RunFailure;
use crate::migration::ledger::Ledger;
use crate::migration::lock::MigrationLockGuard;
use crate::migration::outcome::{StepOutcome, StepStatus};
use crate::migration::record::LedgerEntry;
use crate::migration::status::{MigrationStatus, PendingMigration};
use crate::migration::{Migration, MigrationError, RunOutcome};
use std::collections::HashSet;
use std::time::Duration;

/// Core migration execution engine
///
/// The `Migrator` validates a migration set, derives the pending subset from
/// the ledger and hands it to the [`TransactionCoordinator`]. Pending state is
/// re-read from the ledger on every call, never cached.
///
/// # Examples
///
/// ```no_run
/// use tidemark::migration::{Ledger, Migrator, SqlMigration};
/// use tidemark::SqliteExecutor;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let db = SqliteExecutor::in_memory()?;
/// let migrations = vec![
///     SqlMigration::new(20240120120000, "CREATE TABLE users (id INTEGER PRIMARY KEY)"),
///     SqlMigration::new(20240121090000, "ALTER TABLE users ADD COLUMN email TEXT"),
/// ];
///
/// let migrator = Migrator::new(Ledger::default());
/// let outcome = migrator.execute(&db, &migrations, true)?;
/// assert_eq!(outcome.applied().len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Migrator {
    ledger: Ledger,
    lock_timeout: Option<Duration>,
    cancel: Option<CancelFlag>,
}

impl Migrator {
    /// Create a new Migrator recording into `ledger`
    #[must_use]
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            lock_timeout: None,
            cancel: None,
        }
    }

    /// Hold an advisory lock on the ledger for the duration of each run
    #[must_use]
    pub fn with_lock(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Stop runs between migrations once `flag` is set
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn coordinator(&self) -> TransactionCoordinator {
        match &self.cancel {
            Some(flag) => TransactionCoordinator::new().with_cancel_flag(flag.clone()),
            None => TransactionCoordinator::new(),
        }
    }

    fn lock<'a>(
        &self,
        executor: &'a dyn TideExecutor,
    ) -> Result<Option<MigrationLockGuard<'a>>, MigrationError> {
        self.lock_timeout
            .map(|timeout| MigrationLockGuard::acquire(executor, &self.ledger, timeout))
            .transpose()
    }

    /// Applied identities; a missing ledger table means nothing was applied yet
    fn applied(&self, executor: &dyn TideExecutor) -> Result<HashSet<String>, MigrationError> {
        if self.ledger.exists(executor)? {
            self.ledger.load_applied(executor)
        } else {
            Ok(HashSet::new())
        }
    }

    fn recorded(&self, executor: &dyn TideExecutor) -> Result<Vec<LedgerEntry>, MigrationError> {
        if self.ledger.exists(executor)? {
            self.ledger.entries(executor)
        } else {
            Ok(Vec::new())
        }
    }

    /// Check a migration set before touching the database
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidMigrationSet` if serials are not strictly
    /// ascending (which also covers duplicate serials) or identities repeat.
    pub fn validate<M: Migration>(migrations: &[M]) -> Result<(), MigrationError> {
        for pair in migrations.windows(2) {
            let (prev, next) = (pair[0].serial(), pair[1].serial());
            if next == prev {
                return Err(MigrationError::InvalidMigrationSet(format!(
                    "duplicate serial {next}"
                )));
            }
            if next < prev {
                return Err(MigrationError::InvalidMigrationSet(format!(
                    "migrations must be sorted by serial: {next} follows {prev}"
                )));
            }
        }

        let mut identities = HashSet::with_capacity(migrations.len());
        for migration in migrations {
            let identity = migration.identity();
            if !identities.insert(identity.clone()) {
                return Err(MigrationError::InvalidMigrationSet(format!(
                    "duplicate identity '{identity}'"
                )));
            }
        }
        Ok(())
    }

    /// Migrations from `all` whose identity is not in `applied`, order preserved
    #[must_use]
    pub fn plan<'m, M: Migration>(all: &'m [M], applied: &HashSet<String>) -> Vec<&'m M> {
        all.iter()
            .filter(|m| !applied.contains(&m.identity()))
            .collect()
    }

    /// Apply every pending migration of `all` in one transaction
    ///
    /// `commit = false` performs a damp run: everything is applied and then
    /// rolled back, including the ledger table if this run created it.
    /// Already-applied migrations are reported as skipped.
    ///
    /// # Errors
    ///
    /// `InvalidMigrationSet` before any database interaction; otherwise any
    /// error of [`TransactionCoordinator::run`], lock acquisition or ledger
    /// access. The returned [`RunFailure`] carries the partial outcome.
    pub fn execute<M: Migration>(
        &self,
        executor: &dyn TideExecutor,
        all: &[M],
        commit: bool,
    ) -> Result<RunOutcome, RunFailure> {
        let dry_run = !commit;
        let before_run = |e| RunFailure::before_run(e, dry_run);

        Self::validate(all).map_err(before_run)?;
        let _lock = self.lock(executor).map_err(before_run)?;

        let applied = self.applied(executor).map_err(before_run)?;

        let pending: Vec<&dyn Migration> = Self::plan(all, &applied)
            .into_iter()
            .map(|m| m as &dyn Migration)
            .collect();
        let skipped: Vec<StepOutcome> = all
            .iter()
            .filter(|m| applied.contains(&m.identity()))
            .map(|m| StepOutcome {
                identity: m.identity(),
                serial: m.serial(),
                status: StepStatus::Skipped,
            })
            .collect();

        log::info!(
            "{} migration(s) pending, {} already applied",
            pending.len(),
            skipped.len()
        );

        match self.coordinator().run(executor, &pending, &self.ledger, commit) {
            Ok(mut outcome) => {
                outcome.merge_skipped(skipped);
                Ok(outcome)
            }
            Err(mut failure) => {
                failure.outcome.merge_skipped(skipped);
                Err(failure)
            }
        }
    }

    /// Compare `all` with the ledger
    ///
    /// Read-only: a database without a ledger table reports every migration
    /// as pending.
    ///
    /// # Errors
    ///
    /// `InvalidMigrationSet` for a malformed set, `StoreUnavailable` if the
    /// ledger cannot be read.
    pub fn status<M: Migration>(
        &self,
        executor: &dyn TideExecutor,
        all: &[M],
    ) -> Result<MigrationStatus, MigrationError> {
        Self::validate(all)?;
        let entries = self.recorded(executor)?;

        let known: HashSet<String> = all.iter().map(Migration::identity).collect();
        let recorded: HashSet<&str> = entries.iter().map(|e| e.identity.as_str()).collect();

        let pending = all
            .iter()
            .filter(|m| !recorded.contains(m.identity().as_str()))
            .map(|m| PendingMigration {
                identity: m.identity(),
                serial: m.serial(),
            })
            .collect();

        let (applied, orphaned): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| known.contains(&e.identity));

        if !orphaned.is_empty() {
            log::warn!(
                "{} ledger entr{} have no matching migration",
                orphaned.len(),
                if orphaned.len() == 1 { "y" } else { "ies" }
            );
        }

        Ok(MigrationStatus::new(applied, pending, orphaned))
    }

    /// Revert the newest `steps` applied migrations in one transaction
    ///
    /// Migrations are reverted newest first (by ledger serial) using their
    /// `down` logic; their ledger entries are removed in the same transaction.
    ///
    /// # Errors
    ///
    /// - `UnknownMigration` if a targeted ledger entry has no definition in `all`
    /// - `Irreversible` if a targeted migration has no `down` step
    ///
    /// Both are raised before the transaction opens. Failures during the run
    /// behave as in [`execute`](Self::execute).
    pub fn revert<M: Migration>(
        &self,
        executor: &dyn TideExecutor,
        all: &[M],
        steps: usize,
        commit: bool,
    ) -> Result<RunOutcome, RunFailure> {
        let dry_run = !commit;
        let before_run = |e| RunFailure::before_run(e, dry_run);

        Self::validate(all).map_err(before_run)?;
        let _lock = self.lock(executor).map_err(before_run)?;

        let entries = self.recorded(executor).map_err(before_run)?;

        let mut targets: Vec<&dyn Migration> = Vec::with_capacity(steps);
        for entry in entries.iter().rev().take(steps) {
            let migration = all
                .iter()
                .find(|m| m.identity() == entry.identity)
                .ok_or_else(|| {
                    before_run(MigrationError::UnknownMigration {
                        identity: entry.identity.clone(),
                    })
                })?;
            if !migration.is_reversible() {
                return Err(before_run(MigrationError::Irreversible {
                    identity: entry.identity.clone(),
                }));
            }
            targets.push(migration as &dyn Migration);
        }

        log::info!("reverting {} migration(s)", targets.len());
        self.coordinator()
            .revert(executor, &targets, &self.ledger, commit)
    }
}
