//! Transaction coordinator
//!
//! Runs a list of pending migrations inside exactly one transaction. Every
//! migration's `up` and its ledger write go through the same [`Transaction`]
//! handle, so the run as a whole either commits or leaves no trace.
//!
//! The coordinator is fail-fast: the first failing migration stops the run,
//! later migrations are never attempted, and the transaction is rolled back
//! before the original error is handed back to the caller.

use crate::executor::{TideError, TideExecutor};
use crate::migration::error::RunFailure;
use crate::migration::ledger::Ledger;
use crate::migration::outcome::{RunOutcome, StepStatus};
use crate::migration::{Migration, MigrationError};
use crate::transaction::Transaction;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

/// Shared flag used to cancel a run between migrations
///
/// Clones share the same flag. Setting it does not interrupt a migration that
/// is already executing; the run stops before the next one and rolls back.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request so the flag can be reused
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Database error text reporting a statement that refuses to run in a transaction
const OUTSIDE_TRANSACTION_MARKERS: &[&str] = &[
    "cannot run inside a transaction block",
    "cannot be executed from a function or multi-command string",
    "from within a transaction",
    "cannot start a transaction within a transaction",
];

fn requires_no_transaction(error: &TideError) -> bool {
    // Driver errors may keep the server message in their source chain only
    let mut current: Option<&dyn std::error::Error> = Some(error);
    while let Some(err) = current {
        let message = err.to_string().to_lowercase();
        if OUTSIDE_TRANSACTION_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
        {
            return true;
        }
        current = err.source();
    }
    false
}

#[derive(Clone, Copy)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn verb(self) -> &'static str {
        match self {
            Direction::Up => "apply",
            Direction::Down => "revert",
        }
    }
}

/// Classify an error raised by a migration body
fn step_error(direction: Direction, identity: &str, serial: i64, error: TideError) -> MigrationError {
    match error {
        TideError::TransactionControl(statement) => MigrationError::NonTransactional {
            identity: identity.to_string(),
            statement,
        },
        error if requires_no_transaction(&error) => MigrationError::NonTransactional {
            identity: identity.to_string(),
            statement: error.to_string(),
        },
        source => match direction {
            Direction::Up => MigrationError::ApplyFailed {
                identity: identity.to_string(),
                serial,
                source,
            },
            Direction::Down => MigrationError::RevertFailed {
                identity: identity.to_string(),
                serial,
                source,
            },
        },
    }
}

/// Runs pending migrations atomically
#[derive(Debug, Clone, Default)]
pub struct TransactionCoordinator {
    cancel: Option<CancelFlag>,
}

impl TransactionCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `flag` before each migration
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }

    /// Apply `pending` in order inside one transaction
    ///
    /// The ledger table is created inside the same transaction if missing, so
    /// a damp run (`commit = false`, rolled back even when every migration
    /// succeeded) leaves no ledger behind either. An empty `pending` list opens
    /// no transaction and reports `committed = true`.
    ///
    /// # Errors
    ///
    /// - `NonTransactional` if any pending migration declares a statement that
    ///   cannot run in a transaction (checked before `BEGIN`), or issues one
    /// - `ApplyFailed` / `DuplicateEntry` / `StoreUnavailable` for the first
    ///   failing migration, returned after the rollback completed
    /// - `Cancelled` if the cancel flag was set
    /// - `RollbackFailed` if rolling back failed as well
    /// - `CommitFailed` if `COMMIT` failed
    pub fn run(
        &self,
        executor: &dyn TideExecutor,
        pending: &[&dyn Migration],
        ledger: &Ledger,
        commit: bool,
    ) -> Result<RunOutcome, RunFailure> {
        let dry_run = !commit;
        if pending.is_empty() {
            log::info!("no pending migrations");
            return Ok(RunOutcome::empty(true, dry_run));
        }

        for migration in pending {
            if let Some(statement) = migration.non_transactional_statement() {
                return Err(RunFailure::before_run(
                    MigrationError::NonTransactional {
                        identity: migration.identity(),
                        statement,
                    },
                    dry_run,
                ));
            }
        }

        self.run_steps(
            executor,
            pending,
            Some(ledger),
            commit,
            Direction::Up,
            |tx, migration| {
                let identity = migration.identity();
                let serial = migration.serial();
                migration
                    .up(tx)
                    .map_err(|e| step_error(Direction::Up, &identity, serial, e))?;
                ledger.record_applied(tx, &identity, serial)
            },
        )
    }

    /// Revert `targets` in the given order inside one transaction
    ///
    /// Each target's `down` runs and its ledger entry is removed. Callers pass
    /// the newest migration first.
    ///
    /// # Errors
    ///
    /// Same commit/rollback semantics as [`run`](Self::run), with
    /// `RevertFailed` in place of `ApplyFailed`.
    pub fn revert(
        &self,
        executor: &dyn TideExecutor,
        targets: &[&dyn Migration],
        ledger: &Ledger,
        commit: bool,
    ) -> Result<RunOutcome, RunFailure> {
        if targets.is_empty() {
            log::info!("nothing to revert");
            return Ok(RunOutcome::empty(true, !commit));
        }

        self.run_steps(
            executor,
            targets,
            None,
            commit,
            Direction::Down,
            |tx, migration| {
                let identity = migration.identity();
                let serial = migration.serial();
                migration
                    .down(tx)
                    .map_err(|e| step_error(Direction::Down, &identity, serial, e))?;
                ledger.delete_applied(tx, &identity).map(|_| ())
            },
        )
    }

    fn run_steps<F>(
        &self,
        executor: &dyn TideExecutor,
        migrations: &[&dyn Migration],
        bootstrap: Option<&Ledger>,
        commit: bool,
        direction: Direction,
        step: F,
    ) -> Result<RunOutcome, RunFailure>
    where
        F: Fn(&Transaction<'_>, &dyn Migration) -> Result<(), MigrationError>,
    {
        let dry_run = !commit;
        let tx = Transaction::begin(executor).map_err(|e| {
            RunFailure::before_run(
                MigrationError::store("opening the run transaction", e),
                dry_run,
            )
        })?;

        log::info!(
            "running {} migration(s) to {} ({})",
            migrations.len(),
            direction.verb(),
            if commit { "commit" } else { "damp run" }
        );

        let done = match direction {
            Direction::Up => StepStatus::Applied,
            Direction::Down => StepStatus::Reverted,
        };
        let mut outcome = RunOutcome::empty(false, dry_run);
        let mut failure = bootstrap.and_then(|ledger| ledger.ensure_store(&tx).err());

        for &migration in migrations {
            if failure.is_some() {
                break;
            }
            if self.is_cancelled() {
                log::warn!("cancellation requested, stopping before {}", migration.identity());
                failure = Some(MigrationError::Cancelled);
                break;
            }

            let identity = migration.identity();
            let serial = migration.serial();

            #[cfg(feature = "tracing")]
            let _span = tracing_helpers::migration_span(&identity, serial).entered();

            log::debug!("{}: {identity} (serial {serial})", direction.verb());
            let start = Instant::now();

            match step(&tx, migration) {
                Ok(()) => {
                    log::debug!("{identity} finished in {:?}", start.elapsed());
                    outcome.push(identity, serial, done.clone());
                }
                Err(e) => {
                    log::error!("{identity} failed: {e}");
                    outcome.push(identity, serial, StepStatus::Failed(e.to_string()));
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            None if commit => match tx.commit() {
                Ok(()) => {
                    log::info!("committed {} migration(s)", outcome.steps.len());
                    outcome.committed = true;
                    Ok(outcome)
                }
                Err(e) => {
                    log::error!("commit failed: {e}");
                    Err(RunFailure {
                        error: MigrationError::CommitFailed(e),
                        outcome,
                    })
                }
            },
            None => match tx.rollback() {
                Ok(()) => {
                    log::info!("damp run succeeded, all changes rolled back");
                    Ok(outcome)
                }
                Err(e) => {
                    log::error!("rollback after damp run failed: {e}");
                    Err(RunFailure {
                        error: MigrationError::RollbackFailed {
                            cause: None,
                            source: e,
                        },
                        outcome,
                    })
                }
            },
            Some(error) => match tx.rollback() {
                Ok(()) => {
                    log::warn!("rolled back all changes after error");
                    Err(RunFailure { error, outcome })
                }
                Err(e) => {
                    log::error!("rollback failed: {e}");
                    Err(RunFailure {
                        error: MigrationError::RollbackFailed {
                            cause: Some(Box::new(error)),
                            source: e,
                        },
                        outcome,
                    })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::SqlMigration;
    use crate::{SqliteExecutor, TideExecutor};
    use std::cell::Cell;

    fn setup() -> (SqliteExecutor, Ledger) {
        let db = SqliteExecutor::in_memory().unwrap();
        let ledger = Ledger::default();
        ledger.ensure_store(&db).unwrap();
        (db, ledger)
    }

    fn table_exists(db: &SqliteExecutor, name: &str) -> bool {
        !db.query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            &[name.into()],
        )
        .unwrap()
        .is_empty()
    }

    fn three() -> Vec<SqlMigration> {
        vec![
            SqlMigration::new(1, "CREATE TABLE t1 (x INTEGER)").with_down("DROP TABLE t1"),
            SqlMigration::new(2, "CREATE TABLE t2 (x INTEGER)").with_down("DROP TABLE t2"),
            SqlMigration::new(3, "CREATE TABLE t3 (x INTEGER)").with_down("DROP TABLE t3"),
        ]
    }

    fn refs(migrations: &[SqlMigration]) -> Vec<&dyn Migration> {
        migrations.iter().map(|m| m as &dyn Migration).collect()
    }

    /// Counts how often `up` ran
    struct Counting {
        serial: i64,
        calls: Cell<usize>,
    }

    impl Migration for Counting {
        fn serial(&self) -> i64 {
            self.serial
        }

        fn up(&self, _executor: &dyn TideExecutor) -> Result<(), TideError> {
            self.calls.set(self.calls.get() + 1);
            Ok(())
        }
    }

    /// Sets the cancel flag while it runs
    struct Canceller {
        flag: CancelFlag,
    }

    impl Migration for Canceller {
        fn serial(&self) -> i64 {
            2
        }

        fn up(&self, executor: &dyn TideExecutor) -> Result<(), TideError> {
            executor.batch_execute("CREATE TABLE cancelled_here (x INTEGER)")?;
            self.flag.cancel();
            Ok(())
        }
    }

    #[test]
    fn test_empty_run_commits_without_transaction() {
        let (db, ledger) = setup();
        let outcome = TransactionCoordinator::new()
            .run(&db, &[], &ledger, true)
            .unwrap();
        assert!(outcome.committed);
        assert!(outcome.steps.is_empty());
    }

    #[test]
    fn test_ledger_is_created_inside_the_run_transaction() {
        let db = SqliteExecutor::in_memory().unwrap();
        let ledger = Ledger::default();
        let migrations = three();

        TransactionCoordinator::new()
            .run(&db, &refs(&migrations), &ledger, false)
            .unwrap();
        assert!(!ledger.exists(&db).unwrap());

        TransactionCoordinator::new()
            .run(&db, &refs(&migrations), &ledger, true)
            .unwrap();
        assert_eq!(ledger.load_applied(&db).unwrap().len(), 3);
    }

    #[test]
    fn test_commit_applies_all_and_records() {
        let (db, ledger) = setup();
        let migrations = three();
        let outcome = TransactionCoordinator::new()
            .run(&db, &refs(&migrations), &ledger, true)
            .unwrap();

        assert!(outcome.committed);
        assert!(!outcome.dry_run);
        assert_eq!(outcome.applied_identities(), vec!["1", "2", "3"]);
        assert!(table_exists(&db, "t3"));
        assert_eq!(ledger.load_applied(&db).unwrap().len(), 3);
    }

    #[test]
    fn test_damp_run_rolls_back_everything() {
        let (db, ledger) = setup();
        let migrations = three();
        let outcome = TransactionCoordinator::new()
            .run(&db, &refs(&migrations), &ledger, false)
            .unwrap();

        assert!(!outcome.committed);
        assert!(outcome.dry_run);
        assert_eq!(outcome.applied().len(), 3);
        assert!(!table_exists(&db, "t1"));
        assert!(ledger.load_applied(&db).unwrap().is_empty());
    }

    #[test]
    fn test_failure_stops_and_rolls_back() {
        let (db, ledger) = setup();
        let migrations = vec![
            SqlMigration::new(1, "CREATE TABLE t1 (x INTEGER)"),
            SqlMigration::new(2, "CREATE TABLE t1 (x INTEGER)"),
            SqlMigration::new(3, "CREATE TABLE t3 (x INTEGER)"),
        ];
        let failure = TransactionCoordinator::new()
            .run(&db, &refs(&migrations), &ledger, true)
            .unwrap_err();

        assert!(matches!(
            failure.error,
            MigrationError::ApplyFailed { ref identity, serial: 2, .. } if identity == "2"
        ));
        assert!(failure.error.changes_reverted());
        assert!(!failure.outcome.committed);
        assert_eq!(failure.outcome.steps.len(), 2);
        assert_eq!(failure.outcome.applied_identities(), vec!["1"]);
        assert_eq!(failure.outcome.failed().map(|s| s.serial), Some(2));

        assert!(!table_exists(&db, "t1"));
        assert!(ledger.load_applied(&db).unwrap().is_empty());
    }

    #[test]
    fn test_non_transactional_refused_before_any_statement() {
        let (db, ledger) = setup();
        let first = Counting {
            serial: 1,
            calls: Cell::new(0),
        };
        let vacuum = SqlMigration::new(2, "VACUUM");
        let pending: Vec<&dyn Migration> = vec![&first, &vacuum];

        let failure = TransactionCoordinator::new()
            .run(&db, &pending, &ledger, true)
            .unwrap_err();

        assert!(matches!(
            failure.error,
            MigrationError::NonTransactional { ref identity, ref statement }
                if identity == "2" && statement == "VACUUM"
        ));
        assert_eq!(first.calls.get(), 0);
        assert!(failure.outcome.steps.is_empty());
    }

    /// Issues transaction control from inside `up` without declaring it
    struct SneakyCommit;

    impl Migration for SneakyCommit {
        fn serial(&self) -> i64 {
            1
        }

        fn up(&self, executor: &dyn TideExecutor) -> Result<(), TideError> {
            executor.batch_execute("CREATE TABLE sneaky (x INTEGER)")?;
            executor.execute("COMMIT", &[])?;
            Ok(())
        }
    }

    #[test]
    fn test_transaction_control_inside_up_is_non_transactional() {
        let (db, ledger) = setup();
        let failure = TransactionCoordinator::new()
            .run(&db, &[&SneakyCommit], &ledger, true)
            .unwrap_err();

        assert!(matches!(
            failure.error,
            MigrationError::NonTransactional { ref statement, .. } if statement == "COMMIT"
        ));
        assert!(!table_exists(&db, "sneaky"));
    }

    #[test]
    fn test_cancel_before_start() {
        let (db, ledger) = setup();
        let flag = CancelFlag::new();
        flag.cancel();
        let migrations = three();

        let failure = TransactionCoordinator::new()
            .with_cancel_flag(flag)
            .run(&db, &refs(&migrations), &ledger, true)
            .unwrap_err();

        assert!(matches!(failure.error, MigrationError::Cancelled));
        assert!(failure.outcome.steps.is_empty());
        assert!(!table_exists(&db, "t1"));
    }

    #[test]
    fn test_cancel_mid_run_rolls_back_earlier_work() {
        let (db, ledger) = setup();
        let flag = CancelFlag::new();
        let first = SqlMigration::new(1, "CREATE TABLE t1 (x INTEGER)");
        let second = Canceller { flag: flag.clone() };
        let third = SqlMigration::new(3, "CREATE TABLE t3 (x INTEGER)");
        let pending: Vec<&dyn Migration> = vec![&first, &second, &third];

        let failure = TransactionCoordinator::new()
            .with_cancel_flag(flag.clone())
            .run(&db, &pending, &ledger, true)
            .unwrap_err();

        assert!(matches!(failure.error, MigrationError::Cancelled));
        assert_eq!(failure.outcome.applied_identities(), vec!["1", "2"]);
        assert!(!table_exists(&db, "t1"));
        assert!(!table_exists(&db, "cancelled_here"));
        assert!(ledger.load_applied(&db).unwrap().is_empty());

        flag.reset();
        assert!(!flag.is_cancelled());
    }

    #[test]
    fn test_revert_runs_down_and_removes_entries() {
        let (db, ledger) = setup();
        let migrations = three();
        TransactionCoordinator::new()
            .run(&db, &refs(&migrations), &ledger, true)
            .unwrap();

        let targets: Vec<&dyn Migration> = vec![&migrations[2], &migrations[1]];
        let outcome = TransactionCoordinator::new()
            .revert(&db, &targets, &ledger, true)
            .unwrap();

        assert!(outcome.committed);
        assert_eq!(outcome.reverted().len(), 2);
        assert!(table_exists(&db, "t1"));
        assert!(!table_exists(&db, "t2"));
        let applied = ledger.load_applied(&db).unwrap();
        assert_eq!(applied.len(), 1);
        assert!(applied.contains("1"));
    }

    #[test]
    fn test_revert_failure_restores_state() {
        let (db, ledger) = setup();
        let good = SqlMigration::new(1, "CREATE TABLE t1 (x INTEGER)").with_down("DROP TABLE t1");
        let bad = SqlMigration::new(2, "CREATE TABLE t2 (x INTEGER)").with_down("DROP TABLE missing");
        TransactionCoordinator::new()
            .run(&db, &[&good, &bad], &ledger, true)
            .unwrap();

        let failure = TransactionCoordinator::new()
            .revert(&db, &[&good, &bad], &ledger, true)
            .unwrap_err();

        assert!(matches!(failure.error, MigrationError::RevertFailed { serial: 2, .. }));
        assert!(table_exists(&db, "t1"));
        assert_eq!(ledger.load_applied(&db).unwrap().len(), 2);
    }

    #[test]
    fn test_outside_transaction_message_detection() {
        assert!(requires_no_transaction(&TideError::Query(
            "CREATE INDEX CONCURRENTLY cannot run inside a transaction block".to_string()
        )));
        assert!(requires_no_transaction(&TideError::Other(
            "cannot VACUUM from within a transaction".to_string()
        )));
        assert!(!requires_no_transaction(&TideError::Query(
            "relation \"users\" does not exist".to_string()
        )));
    }
}
