//! Run outcome reporting

/// What happened to one migration during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Executed successfully inside the run transaction
    ///
    /// Whether the effect persisted depends on [`RunOutcome::committed`].
    Applied,
    /// Already recorded in the ledger; not executed
    Skipped,
    /// Down step executed and ledger entry removed (revert runs only)
    Reverted,
    /// Executed and failed; the message is the underlying error
    Failed(String),
}

/// Outcome of a single migration within a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub identity: String,
    pub serial: i64,
    pub status: StepStatus,
}

/// Ordered outcome of one `execute` or `revert` call
///
/// Migrations that were never attempted (after a fail-fast abort) are absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub steps: Vec<StepOutcome>,
    /// `true` only if `COMMIT` returned success (or there was nothing to do)
    pub committed: bool,
    /// The run was asked to roll back even on success
    pub dry_run: bool,
}

impl RunOutcome {
    #[must_use]
    pub fn empty(committed: bool, dry_run: bool) -> Self {
        Self {
            steps: Vec::new(),
            committed,
            dry_run,
        }
    }

    fn with_status(&self, wanted: fn(&StepStatus) -> bool) -> Vec<&StepOutcome> {
        self.steps.iter().filter(|s| wanted(&s.status)).collect()
    }

    /// Steps that executed successfully
    #[must_use]
    pub fn applied(&self) -> Vec<&StepOutcome> {
        self.with_status(|s| matches!(s, StepStatus::Applied))
    }

    /// Steps that were already in the ledger
    #[must_use]
    pub fn skipped(&self) -> Vec<&StepOutcome> {
        self.with_status(|s| matches!(s, StepStatus::Skipped))
    }

    /// Steps whose down logic ran
    #[must_use]
    pub fn reverted(&self) -> Vec<&StepOutcome> {
        self.with_status(|s| matches!(s, StepStatus::Reverted))
    }

    /// The failed step, if the run aborted on one
    #[must_use]
    pub fn failed(&self) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|s| matches!(s.status, StepStatus::Failed(_)))
    }

    /// Identities of applied steps, in order
    #[must_use]
    pub fn applied_identities(&self) -> Vec<String> {
        self.applied().into_iter().map(|s| s.identity.clone()).collect()
    }

    pub(crate) fn push(&mut self, identity: String, serial: i64, status: StepStatus) {
        self.steps.push(StepOutcome {
            identity,
            serial,
            status,
        });
    }

    /// Merge `skipped` steps in, keeping ascending serial order
    pub(crate) fn merge_skipped(&mut self, skipped: Vec<StepOutcome>) {
        if skipped.is_empty() {
            return;
        }
        self.steps.extend(skipped);
        self.steps.sort_by_key(|s| s.serial);
    }
}
