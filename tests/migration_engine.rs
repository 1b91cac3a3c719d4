//! End-to-end tests for the migration engine
//!
//! These run against real SQLite databases (in memory, or a file when the test
//! needs to reconnect), so every run exercises genuine BEGIN/COMMIT/ROLLBACK.

use std::cell::Cell;
use std::path::Path;

use tempfile::TempDir;
use tidemark::migration::{
    Ledger, Migration, MigrationError, Migrator, ScaffoldGenerator, SqlMigration, StepStatus,
};
use tidemark::{Dialect, SqlValue, SqliteExecutor, TextRow, TideError, TideExecutor};

fn three_tables() -> Vec<SqlMigration> {
    vec![
        SqlMigration::new(1, "CREATE TABLE t1 (id INTEGER PRIMARY KEY)").with_down("DROP TABLE t1"),
        SqlMigration::new(2, "CREATE TABLE t2 (id INTEGER PRIMARY KEY)").with_down("DROP TABLE t2"),
        SqlMigration::new(3, "CREATE TABLE t3 (id INTEGER PRIMARY KEY)").with_down("DROP TABLE t3"),
    ]
}

/// Names of user tables, excluding the ledger
fn user_tables(db: &SqliteExecutor) -> Vec<String> {
    db.query(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '\\_\\_%' ESCAPE '\\' ORDER BY name",
        &[],
    )
    .expect("Failed to list tables")
    .into_iter()
    .filter_map(|row| row.into_iter().next().flatten())
    .collect()
}

/// Every table in the database, the ledger included
fn all_tables(db: &SqliteExecutor) -> Vec<String> {
    db.query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name", &[])
        .expect("Failed to list tables")
        .into_iter()
        .filter_map(|row| row.into_iter().next().flatten())
        .collect()
}

fn ledger_identities(db: &SqliteExecutor) -> Vec<String> {
    let ledger = Ledger::default();
    if !ledger.exists(db).expect("Failed to look up ledger") {
        return Vec::new();
    }
    ledger
        .entries(db)
        .expect("Failed to read ledger")
        .into_iter()
        .map(|e| e.identity)
        .collect()
}

#[test]
fn test_fresh_database_applies_all() {
    let db = SqliteExecutor::in_memory().expect("Failed to open database");
    let migrator = Migrator::default();
    let all = three_tables();

    let outcome = migrator.execute(&db, &all, true).expect("Run should succeed");
    assert!(outcome.committed);
    assert_eq!(outcome.applied_identities(), vec!["1", "2", "3"]);
    assert_eq!(ledger_identities(&db), vec!["1", "2", "3"]);
    assert_eq!(user_tables(&db), vec!["t1", "t2", "t3"]);

    let ledger = Ledger::default();
    let applied = ledger.load_applied(&db).expect("Failed to load ledger");
    assert!(Migrator::plan(&all, &applied).is_empty());
}

#[test]
fn test_second_run_is_a_noop() {
    let db = SqliteExecutor::in_memory().expect("Failed to open database");
    let migrator = Migrator::default();
    let all = three_tables();

    migrator.execute(&db, &all, true).expect("First run should succeed");
    let before = Ledger::default().entries(&db).expect("Failed to read ledger");

    let outcome = migrator.execute(&db, &all, true).expect("Second run should succeed");
    assert!(outcome.committed);
    assert!(outcome.applied().is_empty());
    assert_eq!(outcome.skipped().len(), 3);
    assert_eq!(Ledger::default().entries(&db).expect("Failed to read ledger"), before);
}

#[test]
fn test_partially_applied_ledger_plans_remaining() {
    let db = SqliteExecutor::in_memory().expect("Failed to open database");
    let migrator = Migrator::default();
    let all = three_tables();

    migrator.execute(&db, &all[..1], true).expect("Seed run should succeed");

    let outcome = migrator.execute(&db, &all, true).expect("Run should succeed");
    assert_eq!(outcome.applied_identities(), vec!["2", "3"]);
    assert_eq!(outcome.steps[0].status, StepStatus::Skipped);
    assert_eq!(ledger_identities(&db), vec!["1", "2", "3"]);
}

#[test]
fn test_failure_leaves_state_as_before() {
    let db = SqliteExecutor::in_memory().expect("Failed to open database");
    let migrator = Migrator::default();
    let all = vec![
        SqlMigration::new(1, "CREATE TABLE t1 (id INTEGER PRIMARY KEY)"),
        SqlMigration::new(2, "INSERT INTO missing_table VALUES (1)"),
        SqlMigration::new(3, "CREATE TABLE t3 (id INTEGER PRIMARY KEY)"),
    ];

    let failure = migrator.execute(&db, &all, true).expect_err("Run should fail");

    assert!(matches!(failure.error, MigrationError::ApplyFailed { serial: 2, .. }));
    assert!(failure.error.changes_reverted());
    assert!(!failure.outcome.committed);
    assert_eq!(failure.outcome.steps.len(), 2);
    assert_eq!(failure.outcome.steps[0].status, StepStatus::Applied);
    assert!(matches!(failure.outcome.steps[1].status, StepStatus::Failed(_)));

    assert!(all_tables(&db).is_empty());
}

#[test]
fn test_failure_keeps_earlier_committed_runs() {
    let db = SqliteExecutor::in_memory().expect("Failed to open database");
    let migrator = Migrator::default();
    let mut all = three_tables();
    migrator.execute(&db, &all[..1], true).expect("Seed run should succeed");

    all[2] = SqlMigration::new(3, "CREATE TABLE t1 (id INTEGER PRIMARY KEY)");
    let failure = migrator.execute(&db, &all, true).expect_err("Run should fail");

    assert_eq!(failure.outcome.skipped().len(), 1);
    assert_eq!(failure.outcome.applied_identities(), vec!["2"]);
    assert_eq!(user_tables(&db), vec!["t1"]);
    assert_eq!(ledger_identities(&db), vec!["1"]);
}

#[test]
fn test_damp_run_changes_nothing() {
    let db = SqliteExecutor::in_memory().expect("Failed to open database");
    let migrator = Migrator::default();
    let all = three_tables();

    let outcome = migrator.execute(&db, &all, false).expect("Damp run should succeed");
    assert!(outcome.dry_run);
    assert!(!outcome.committed);
    assert_eq!(outcome.applied().len(), 3);
    assert!(all_tables(&db).is_empty());

    migrator.execute(&db, &all[..1], true).expect("Seed run should succeed");
    let before = all_tables(&db);
    migrator.execute(&db, &all, false).expect("Damp run should succeed");
    assert_eq!(all_tables(&db), before);
    assert_eq!(ledger_identities(&db), vec!["1"]);

    let outcome = migrator.execute(&db, &all, true).expect("Real run should succeed");
    assert_eq!(outcome.applied_identities(), vec!["2", "3"]);
}

#[test]
fn test_damp_run_surfaces_errors() {
    let db = SqliteExecutor::in_memory().expect("Failed to open database");
    let all = vec![SqlMigration::new(1, "CREATE TABLE (")];

    let failure = Migrator::default()
        .execute(&db, &all, false)
        .expect_err("Damp run should fail");
    assert!(failure.outcome.dry_run);
    assert!(matches!(failure.error, MigrationError::ApplyFailed { .. }));
}

/// Executor that records every call and fails them all
#[derive(Default)]
struct Untouchable {
    calls: Cell<usize>,
}

impl Untouchable {
    fn touched(&self) -> Result<(), TideError> {
        self.calls.set(self.calls.get() + 1);
        Err(TideError::Other("database must not be used".to_string()))
    }
}

impl TideExecutor for Untouchable {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, _sql: &str, _params: &[SqlValue]) -> Result<u64, TideError> {
        self.touched().map(|()| 0)
    }

    fn batch_execute(&self, _sql: &str) -> Result<(), TideError> {
        self.touched()
    }

    fn query(&self, _sql: &str, _params: &[SqlValue]) -> Result<Vec<TextRow>, TideError> {
        self.touched().map(|()| Vec::new())
    }
}

/// SQLite executor whose `COMMIT` or `ROLLBACK` fails
struct FailingEnd {
    inner: SqliteExecutor,
    statement: &'static str,
}

impl FailingEnd {
    fn new(statement: &'static str) -> Self {
        Self {
            inner: SqliteExecutor::in_memory().expect("Failed to open database"),
            statement,
        }
    }
}

impl TideExecutor for FailingEnd {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, TideError> {
        if sql == self.statement {
            return Err(TideError::Other(format!("{sql} lost the connection")));
        }
        self.inner.execute(sql, params)
    }

    fn batch_execute(&self, sql: &str) -> Result<(), TideError> {
        self.inner.batch_execute(sql)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<TextRow>, TideError> {
        self.inner.query(sql, params)
    }
}

#[test]
fn test_failed_rollback_keeps_the_original_error() {
    let db = FailingEnd::new("ROLLBACK");
    let all = vec![
        SqlMigration::new(1, "CREATE TABLE t1 (id INTEGER PRIMARY KEY)"),
        SqlMigration::new(2, "INSERT INTO missing_table VALUES (1)"),
    ];

    let failure = Migrator::default()
        .execute(&db, &all, true)
        .expect_err("Run should fail");

    match &failure.error {
        MigrationError::RollbackFailed { cause: Some(cause), .. } => {
            assert!(matches!(**cause, MigrationError::ApplyFailed { serial: 2, .. }));
        }
        other => panic!("expected a rollback failure, got {other}"),
    }
    assert_eq!(failure.error.identity(), Some("2"));
    assert!(!failure.error.changes_reverted());
    assert!(!failure.outcome.committed);
    assert_eq!(failure.outcome.applied_identities(), vec!["1"]);
}

#[test]
fn test_failed_damp_rollback_has_no_cause() {
    let db = FailingEnd::new("ROLLBACK");

    let failure = Migrator::default()
        .execute(&db, &three_tables(), false)
        .expect_err("Damp run should fail");

    assert!(matches!(failure.error, MigrationError::RollbackFailed { cause: None, .. }));
    assert!(!failure.error.changes_reverted());
    assert!(!failure.outcome.committed);
    assert!(failure.outcome.dry_run);
    assert_eq!(failure.outcome.applied().len(), 3);
}

#[test]
fn test_failed_commit_is_not_reported_committed() {
    let db = FailingEnd::new("COMMIT");

    let failure = Migrator::default()
        .execute(&db, &three_tables(), true)
        .expect_err("Run should fail");

    assert!(matches!(failure.error, MigrationError::CommitFailed(_)));
    assert!(!failure.error.changes_reverted());
    assert!(!failure.outcome.committed);
    assert_eq!(failure.outcome.applied().len(), 3);
}

#[test]
fn test_invalid_sets_are_rejected_before_touching_the_database() {
    let db = Untouchable::default();
    let migrator = Migrator::default();

    let duplicate = vec![SqlMigration::new(1, "SELECT 1"), SqlMigration::new(1, "SELECT 2")];
    let failure = migrator.execute(&db, &duplicate, true).expect_err("Should reject");
    assert!(matches!(failure.error, MigrationError::InvalidMigrationSet(_)));

    let unsorted = vec![SqlMigration::new(3, "SELECT 1"), SqlMigration::new(2, "SELECT 2")];
    let failure = migrator.execute(&db, &unsorted, true).expect_err("Should reject");
    assert!(matches!(failure.error, MigrationError::InvalidMigrationSet(_)));

    let failure = migrator.revert(&db, &duplicate, 1, true).expect_err("Should reject");
    assert!(matches!(failure.error, MigrationError::InvalidMigrationSet(_)));

    assert_eq!(db.calls.get(), 0);
}

#[test]
fn test_non_transactional_migration_is_refused() {
    let db = SqliteExecutor::in_memory().expect("Failed to open database");
    let all = vec![
        SqlMigration::new(1, "CREATE TABLE t1 (id INTEGER PRIMARY KEY)"),
        SqlMigration::new(2, "CREATE INDEX CONCURRENTLY idx ON t1 (id)"),
    ];

    let failure = Migrator::default()
        .execute(&db, &all, true)
        .expect_err("Run should be refused");
    assert!(matches!(
        failure.error,
        MigrationError::NonTransactional { ref identity, .. } if identity == "2"
    ));
    assert!(failure.outcome.steps.is_empty());
    assert!(all_tables(&db).is_empty());
}

/// Counts how often it ran; used to check ordering and exactly-once application
struct Tracked<'a> {
    serial: i64,
    log: &'a std::cell::RefCell<Vec<i64>>,
}

impl Migration for Tracked<'_> {
    fn serial(&self) -> i64 {
        self.serial
    }

    fn up(&self, executor: &dyn TideExecutor) -> Result<(), TideError> {
        self.log.borrow_mut().push(self.serial);
        executor.batch_execute(&format!("CREATE TABLE tracked_{} (id INTEGER)", self.serial))
    }
}

#[test]
fn test_migrations_run_in_serial_order_exactly_once() {
    let db = SqliteExecutor::in_memory().expect("Failed to open database");
    let log = std::cell::RefCell::new(Vec::new());
    let all: Vec<Box<dyn Migration + '_>> = vec![
        Box::new(Tracked { serial: 10, log: &log }),
        Box::new(Tracked { serial: 20, log: &log }),
        Box::new(Tracked { serial: 30, log: &log }),
    ];

    let migrator = Migrator::default();
    migrator.execute(&db, &all, true).expect("Run should succeed");
    migrator.execute(&db, &all, true).expect("Re-run should succeed");

    assert_eq!(*log.borrow(), vec![10, 20, 30]);
}

#[test]
fn test_revert_restores_previous_schema() {
    let db = SqliteExecutor::in_memory().expect("Failed to open database");
    let migrator = Migrator::default();
    let all = three_tables();
    migrator.execute(&db, &all, true).expect("Run should succeed");

    let outcome = migrator.revert(&db, &all, 2, true).expect("Revert should succeed");
    let reverted: Vec<&str> = outcome.reverted().iter().map(|s| s.identity.as_str()).collect();
    assert_eq!(reverted, vec!["3", "2"]);
    assert_eq!(user_tables(&db), vec!["t1"]);
    assert_eq!(ledger_identities(&db), vec!["1"]);

    // Reverted migrations are pending again
    let outcome = migrator.execute(&db, &all, true).expect("Re-apply should succeed");
    assert_eq!(outcome.applied_identities(), vec!["2", "3"]);
}

#[test]
fn test_damp_revert_changes_nothing() {
    let db = SqliteExecutor::in_memory().expect("Failed to open database");
    let migrator = Migrator::default();
    let all = three_tables();
    migrator.execute(&db, &all, true).expect("Run should succeed");

    let outcome = migrator.revert(&db, &all, 3, false).expect("Damp revert should succeed");
    assert!(!outcome.committed);
    assert_eq!(outcome.reverted().len(), 3);
    assert_eq!(user_tables(&db), vec!["t1", "t2", "t3"]);
    assert_eq!(ledger_identities(&db), vec!["1", "2", "3"]);
}

#[test]
fn test_committed_state_survives_reconnect() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("app.db");
    let all = three_tables();

    {
        let db = SqliteExecutor::open(&path).expect("Failed to open database");
        Migrator::default()
            .execute(&db, &all[..2], true)
            .expect("Run should succeed");
    }

    let db = SqliteExecutor::open(&path).expect("Failed to reopen database");
    let status = Migrator::default().status(&db, &all).expect("Status should load");
    assert_eq!(status.applied_count, 2);
    assert_eq!(status.next_pending_serial(), Some(3));
}

#[test]
fn test_custom_ledger_table() {
    let db = SqliteExecutor::in_memory().expect("Failed to open database");
    let ledger = Ledger::new("main", "schema_history");
    Migrator::new(ledger)
        .execute(&db, &three_tables(), true)
        .expect("Run should succeed");

    let rows = db
        .query("SELECT identity FROM schema_history ORDER BY serial", &[])
        .expect("Custom ledger table should exist");
    assert_eq!(rows.len(), 3);
    assert!(Ledger::default().load_applied(&db).is_err());
}

fn scaffold_serial(path: &Path) -> i64 {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .and_then(|s| s.parse().ok())
        .expect("Scaffold name should start with a serial")
}

#[test]
fn test_scaffolds_have_increasing_serials() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = dir.path().join("migrations");
    let generator = ScaffoldGenerator::new();

    let first = generator
        .create(&target, "-- {{serial}}")
        .expect("First scaffold should be written");
    let second = generator
        .create(&target, "-- {{serial}}")
        .expect("Second scaffold should be written");

    assert!(scaffold_serial(&second) > scaffold_serial(&first));
    assert_eq!(
        std::fs::read_to_string(&first).expect("Failed to read scaffold"),
        format!("-- {}", scaffold_serial(&first))
    );
}
