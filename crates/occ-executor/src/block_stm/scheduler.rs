use crate::block_stm::types::{
    AbortSignal, ExecutionStatus, Incarnation, TxnIndex, ValidationResult, Version,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Scheduler-side state of one transaction.
#[derive(Debug, Clone)]
struct TxnState {
    incarnation: Incarnation,
    status: ExecutionStatus,
    /// Lower transactions that must be validated before the next incarnation.
    dependencies: BTreeSet<TxnIndex>,
    /// Writer whose estimate interrupted the latest incarnation.
    aborted_by: Option<TxnIndex>,
}

impl Default for TxnState {
    fn default() -> Self {
        Self {
            incarnation: 0,
            status: ExecutionStatus::Pending,
            dependencies: BTreeSet::new(),
            aborted_by: None,
        }
    }
}

impl TxnState {
    fn reincarnate(&mut self) -> Incarnation {
        self.incarnation += 1;
        self.status = ExecutionStatus::Pending;
        self.dependencies.clear();
        self.aborted_by = None;
        self.incarnation
    }
}

/// What the main loop must do with a transaction after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationDecision {
    /// Observations hold; the incarnation is final unless a lower transaction changes.
    Validated,
    /// Dependencies are validated; the next incarnation is pending.
    Reexecute { next_incarnation: Incarnation },
    /// Parked until every listed dependency is validated.
    Wait { dependencies: Vec<TxnIndex> },
}

/// Per-transaction status machine.
///
/// `Pending -> Executing -> {Executed | Aborted} -> {Validated | Waiting} ->
/// Pending (next incarnation) -> ... -> Validated`
///
/// Execution workers call [`Self::try_incarnate`] and [`Self::finish_execution`]
/// concurrently. Everything else is driven by the main loop between phases.
#[derive(Debug)]
pub struct Scheduler {
    txn_states: Vec<Mutex<TxnState>>,
    num_txns: u32,
}

impl Scheduler {
    pub fn new(num_txns: usize) -> Self {
        Self {
            txn_states: std::iter::repeat_with(|| Mutex::new(TxnState::default()))
                .take(num_txns)
                .collect(),
            num_txns: num_txns as u32,
        }
    }

    fn state(&self, txn_idx: TxnIndex) -> &Mutex<TxnState> {
        &self.txn_states[txn_idx as usize]
    }

    /// Get the total number of transactions.
    pub fn num_txns(&self) -> usize {
        self.num_txns as usize
    }

    /// Get the current execution status of a transaction.
    pub fn get_status(&self, txn_idx: TxnIndex) -> ExecutionStatus {
        self.state(txn_idx).lock().status
    }

    pub fn incarnation(&self, txn_idx: TxnIndex) -> Incarnation {
        self.state(txn_idx).lock().incarnation
    }

    /// Dependencies recorded by the latest abort or failed validation.
    pub fn dependencies(&self, txn_idx: TxnIndex) -> Vec<TxnIndex> {
        self.state(txn_idx).lock().dependencies.iter().copied().collect()
    }

    fn statuses(&self) -> Vec<ExecutionStatus> {
        self.txn_states.iter().map(|state| state.lock().status).collect()
    }

    /// Claim a pending transaction for execution.
    pub fn try_incarnate(&self, txn_idx: TxnIndex) -> Option<Version> {
        if txn_idx >= self.num_txns {
            return None;
        }
        let mut state = self.state(txn_idx).lock();
        if state.status == ExecutionStatus::Pending {
            state.status = ExecutionStatus::Executing;
            return Some(Version::new(txn_idx, state.incarnation));
        }
        None
    }

    /// Record the end of an incarnation. An incarnation that observed an
    /// estimate ends Aborted even if it returned normally.
    pub fn finish_execution(&self, version: Version, aborted: Option<AbortSignal>) {
        let mut state = self.state(version.txn_idx).lock();
        debug_assert_eq!(state.status, ExecutionStatus::Executing);
        if state.incarnation != version.incarnation {
            return;
        }
        match aborted {
            Some(signal) => {
                state.status = ExecutionStatus::Aborted;
                state.aborted_by = Some(signal.dependent_txn_idx);
                state.dependencies.insert(signal.dependent_txn_idx);
            }
            None => state.status = ExecutionStatus::Executed,
        }
    }

    /// Move Waiting transactions whose dependencies are all validated back to
    /// Pending, then list every Pending transaction in index order.
    pub fn tasks_to_execute(&self) -> Vec<TxnIndex> {
        let mut statuses = self.statuses();
        for txn_idx in 0..self.num_txns {
            if statuses[txn_idx as usize] != ExecutionStatus::Waiting {
                continue;
            }
            let mut state = self.state(txn_idx).lock();
            let ready = state
                .dependencies
                .iter()
                .all(|dep| statuses[*dep as usize] == ExecutionStatus::Validated);
            if ready {
                state.reincarnate();
                statuses[txn_idx as usize] = ExecutionStatus::Pending;
            }
        }
        (0..self.num_txns)
            .filter(|txn_idx| statuses[*txn_idx as usize] == ExecutionStatus::Pending)
            .collect()
    }

    /// Lowest index that is not Validated.
    pub fn first_non_validated(&self) -> Option<TxnIndex> {
        (0..self.num_txns).find(|txn_idx| self.get_status(*txn_idx) != ExecutionStatus::Validated)
    }

    pub fn all_validated(&self) -> bool {
        self.first_non_validated().is_none()
    }

    /// Every transaction from the first non-validated index onward holding a
    /// finished incarnation.
    pub fn tasks_to_validate(&self) -> Vec<TxnIndex> {
        let Some(first) = self.first_non_validated() else {
            return Vec::new();
        };
        (first..self.num_txns)
            .filter(|txn_idx| self.get_status(*txn_idx).is_validatable())
            .collect()
    }

    /// Apply a validation outcome. Must be called in increasing index order so
    /// that dependency statuses reflect the same validation pass.
    pub fn finish_validation(
        &self,
        txn_idx: TxnIndex,
        result: &ValidationResult,
    ) -> ValidationDecision {
        let (aborted_by, status) = {
            let state = self.state(txn_idx).lock();
            (state.aborted_by, state.status)
        };
        debug_assert!(status.is_validatable());

        // An aborted incarnation never validates, whatever its partial reads say.
        if result.is_valid() && aborted_by.is_none() {
            self.state(txn_idx).lock().status = ExecutionStatus::Validated;
            return ValidationDecision::Validated;
        }

        let dependencies: BTreeSet<TxnIndex> = result
            .conflicts()
            .iter()
            .copied()
            .chain(aborted_by)
            .filter(|dep| *dep < txn_idx)
            .collect();
        let ready = dependencies
            .iter()
            .all(|dep| self.get_status(*dep) == ExecutionStatus::Validated);

        let mut state = self.state(txn_idx).lock();
        if ready {
            ValidationDecision::Reexecute {
                next_incarnation: state.reincarnate(),
            }
        } else {
            state.status = ExecutionStatus::Waiting;
            state.dependencies = dependencies.clone();
            ValidationDecision::Wait {
                dependencies: dependencies.into_iter().collect(),
            }
        }
    }

    /// Every transaction from the first non-validated index to the end, each
    /// moved to Pending. Transactions that already ran get a fresh incarnation.
    pub fn prepare_sequential(&self) -> Vec<TxnIndex> {
        let Some(first) = self.first_non_validated() else {
            return Vec::new();
        };
        (first..self.num_txns)
            .inspect(|txn_idx| {
                let mut state = self.state(*txn_idx).lock();
                if state.status != ExecutionStatus::Pending {
                    state.reincarnate();
                }
            })
            .collect()
    }

    /// Mark a transaction validated without a validation pass.
    pub fn mark_validated(&self, txn_idx: TxnIndex) {
        let mut state = self.state(txn_idx).lock();
        state.status = ExecutionStatus::Validated;
        state.dependencies.clear();
        state.aborted_by = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn execute(scheduler: &Scheduler, txn_idx: TxnIndex) -> Version {
        let version = scheduler.try_incarnate(txn_idx).unwrap();
        scheduler.finish_execution(version, None);
        version
    }

    #[test]
    fn test_scheduler_new() {
        let scheduler = Scheduler::new(10);
        assert_eq!(scheduler.num_txns(), 10);
        assert_eq!(scheduler.first_non_validated(), Some(0));
    }

    #[test]
    fn test_initial_status_is_pending() {
        let scheduler = Scheduler::new(5);
        for i in 0..5 {
            assert_eq!(scheduler.get_status(i), ExecutionStatus::Pending);
            assert_eq!(scheduler.incarnation(i), 0);
        }
        assert_eq!(scheduler.tasks_to_execute(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_execution_changes_status_to_executing() {
        let scheduler = Scheduler::new(5);
        assert_eq!(scheduler.try_incarnate(0), Some(Version::new(0, 0)));
        assert_eq!(scheduler.get_status(0), ExecutionStatus::Executing);
        // Cannot claim the same transaction twice
        assert_eq!(scheduler.try_incarnate(0), None);
        assert_eq!(scheduler.try_incarnate(5), None);
    }

    #[test]
    fn test_finish_execution_changes_status() {
        let scheduler = Scheduler::new(3);
        execute(&scheduler, 0);
        assert_eq!(scheduler.get_status(0), ExecutionStatus::Executed);

        let version = scheduler.try_incarnate(2).unwrap();
        scheduler.finish_execution(version, Some(AbortSignal::new(1)));
        assert_eq!(scheduler.get_status(2), ExecutionStatus::Aborted);
        assert_eq!(scheduler.dependencies(2), vec![1]);
    }

    #[test]
    fn test_validation_after_execution() {
        let scheduler = Scheduler::new(3);
        for i in 0..3 {
            execute(&scheduler, i);
        }
        assert_eq!(scheduler.tasks_to_validate(), vec![0, 1, 2]);
        for i in 0..3 {
            assert_eq!(
                scheduler.finish_validation(i, &ValidationResult::Valid),
                ValidationDecision::Validated
            );
        }
        assert!(scheduler.all_validated());
        assert!(scheduler.tasks_to_validate().is_empty());
    }

    #[test]
    fn test_invalid_with_validated_dependency_reexecutes() {
        let scheduler = Scheduler::new(3);
        for i in 0..3 {
            execute(&scheduler, i);
        }
        scheduler.finish_validation(0, &ValidationResult::Valid);
        let decision = scheduler.finish_validation(
            1,
            &ValidationResult::Invalid {
                conflicts: vec![0],
            },
        );
        assert_eq!(
            decision,
            ValidationDecision::Reexecute {
                next_incarnation: 1
            }
        );
        assert_eq!(scheduler.get_status(1), ExecutionStatus::Pending);
        assert_eq!(scheduler.try_incarnate(1), Some(Version::new(1, 1)));
    }

    #[test]
    fn test_invalid_with_pending_dependency_waits() {
        let scheduler = Scheduler::new(3);
        for i in 0..3 {
            execute(&scheduler, i);
        }
        scheduler.finish_validation(0, &ValidationResult::Valid);
        scheduler.finish_validation(1, &ValidationResult::Invalid { conflicts: vec![] });
        let decision = scheduler.finish_validation(
            2,
            &ValidationResult::Invalid {
                conflicts: vec![0, 1],
            },
        );
        assert_eq!(
            decision,
            ValidationDecision::Wait {
                dependencies: vec![0, 1]
            }
        );
        assert_eq!(scheduler.get_status(2), ExecutionStatus::Waiting);

        // Waiting task stays parked until tx 1 validates
        assert_eq!(scheduler.tasks_to_execute(), vec![1]);
        execute(&scheduler, 1);
        scheduler.finish_validation(1, &ValidationResult::Valid);
        assert_eq!(scheduler.tasks_to_execute(), vec![2]);
        assert_eq!(scheduler.incarnation(2), 1);
    }

    #[test]
    fn test_aborted_never_validates() {
        let scheduler = Scheduler::new(2);
        execute(&scheduler, 0);
        let version = scheduler.try_incarnate(1).unwrap();
        scheduler.finish_execution(version, Some(AbortSignal::new(0)));

        scheduler.finish_validation(0, &ValidationResult::Valid);
        let decision = scheduler.finish_validation(1, &ValidationResult::Valid);
        assert_eq!(
            decision,
            ValidationDecision::Reexecute {
                next_incarnation: 1
            }
        );
    }

    #[test]
    fn test_validated_task_can_be_invalidated_again() {
        let scheduler = Scheduler::new(2);
        execute(&scheduler, 0);
        execute(&scheduler, 1);
        scheduler.finish_validation(0, &ValidationResult::Valid);
        scheduler.finish_validation(1, &ValidationResult::Valid);
        assert!(scheduler.all_validated());

        // tx 0 turned invalid in a later pass, so tx 1 is revalidated too
        scheduler.finish_validation(0, &ValidationResult::Invalid { conflicts: vec![] });
        assert_eq!(scheduler.first_non_validated(), Some(0));
        assert_eq!(scheduler.tasks_to_validate(), vec![1]);
    }

    #[test]
    fn test_prepare_sequential_suffix() {
        let scheduler = Scheduler::new(4);
        for i in 0..4 {
            execute(&scheduler, i);
        }
        scheduler.finish_validation(0, &ValidationResult::Valid);
        scheduler.finish_validation(1, &ValidationResult::Invalid { conflicts: vec![] });
        scheduler.finish_validation(2, &ValidationResult::Valid);

        assert_eq!(scheduler.prepare_sequential(), vec![1, 2, 3]);
        assert_eq!(scheduler.get_status(0), ExecutionStatus::Validated);
        for i in 1..4 {
            assert_eq!(scheduler.get_status(i), ExecutionStatus::Pending);
        }
        // tx 1 was already pending after its failed validation
        assert_eq!(scheduler.incarnation(1), 1);
        assert_eq!(scheduler.incarnation(2), 1);
        assert_eq!(scheduler.incarnation(3), 1);

        for i in 1..4 {
            execute(&scheduler, i);
            scheduler.mark_validated(i);
        }
        assert!(scheduler.all_validated());
    }

    // ==================== STRESS TESTS ====================

    #[test]
    fn stress_test_concurrent_task_claiming() {
        let num_txns = 200;
        let scheduler = Arc::new(Scheduler::new(num_txns));
        let claimed = Arc::new(Mutex::new(Vec::new()));

        std::thread::scope(|s| {
            for _ in 0..8 {
                let scheduler = Arc::clone(&scheduler);
                let claimed = Arc::clone(&claimed);
                s.spawn(move || {
                    for txn_idx in 0..num_txns as TxnIndex {
                        if let Some(version) = scheduler.try_incarnate(txn_idx) {
                            scheduler.finish_execution(version, None);
                            claimed.lock().push(txn_idx);
                        }
                    }
                });
            }
        });

        let mut claimed = claimed.lock().clone();
        claimed.sort_unstable();
        // Every transaction executed exactly once
        assert_eq!(claimed, (0..num_txns as TxnIndex).collect::<Vec<_>>());
    }

    #[test]
    fn stress_test_random_invalidations_terminate() {
        use rand::prelude::*;

        let num_txns = 64;
        let scheduler = Scheduler::new(num_txns);
        let mut rng = rand::rng();
        let mut rounds = 0;

        while !scheduler.all_validated() {
            rounds += 1;
            assert!(rounds < 10_000, "scheduler did not converge");
            for txn_idx in scheduler.tasks_to_execute() {
                execute(&scheduler, txn_idx);
            }
            let Some(first) = scheduler.first_non_validated() else {
                break;
            };
            for txn_idx in scheduler.tasks_to_validate() {
                // The first non-validated task only reads validated state, so it always holds
                let result = if txn_idx > first && rng.random_ratio(1, 4) {
                    ValidationResult::Invalid {
                        conflicts: vec![rng.random_range(0..txn_idx)],
                    }
                } else {
                    ValidationResult::Valid
                };
                scheduler.finish_validation(txn_idx, &result);
            }
        }
    }
}
