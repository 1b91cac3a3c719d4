//! Migration status tracking

use crate::migration::record::LedgerEntry;

/// Migration status information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Ledger entries that match a supplied migration, by serial
    pub applied: Vec<LedgerEntry>,

    /// Supplied migrations not yet in the ledger, in application order
    pub pending: Vec<PendingMigration>,

    /// Ledger entries with no matching migration definition
    pub orphaned: Vec<LedgerEntry>,

    /// Number of applied migrations
    pub applied_count: usize,

    /// Number of pending migrations
    pub pending_count: usize,
}

/// Represents a pending migration (not yet applied)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMigration {
    pub identity: String,
    pub serial: i64,
}

impl MigrationStatus {
    #[must_use]
    pub fn new(
        applied: Vec<LedgerEntry>,
        pending: Vec<PendingMigration>,
        orphaned: Vec<LedgerEntry>,
    ) -> Self {
        let applied_count = applied.len();
        let pending_count = pending.len();

        Self {
            applied,
            pending,
            orphaned,
            applied_count,
            pending_count,
        }
    }

    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }

    /// Get the latest applied migration serial
    #[must_use]
    pub fn latest_applied_serial(&self) -> Option<i64> {
        self.applied.iter().map(|m| m.serial).max()
    }

    /// Get the next pending migration serial
    #[must_use]
    pub fn next_pending_serial(&self) -> Option<i64> {
        self.pending.first().map(|m| m.serial)
    }
}
