use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Span};

use crate::{
    args::{CommitPolicy, ExecutorConfig},
    block_stm::{
        base_store::{BaseStore, BaseStoreError},
        db_adapter::{VersionedStore, VersionedStoreError},
        mv_store::MultiVersionStore,
        scheduler::{Scheduler, ValidationDecision},
        types::{AbortSignal, TxnIndex, TxnOutcome, TxnOutput, ValidationResult, Version, WriteSet},
    },
};

/// Errors that end a batch without committing anything.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("batch execution cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] BaseStoreError),
    #[error("transaction {txn_idx} read an estimate of {aborted_txn_idx} in sequential mode")]
    UnexpectedAbort {
        txn_idx: TxnIndex,
        aborted_txn_idx: TxnIndex,
    },
    #[error("transaction {txn_idx} is not validated")]
    NotValidated { txn_idx: TxnIndex },
}

/// Counters describing how a batch converged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Parallel rounds run
    pub rounds: usize,
    /// Incarnations started, including sequential ones
    pub executions: usize,
    /// Incarnations that read an estimate
    pub execution_aborts: usize,
    pub validations: usize,
    /// Validations that sent a transaction back for re-execution
    pub validation_failures: usize,
    pub sequential_fallback: bool,
    /// Transactions executed by the sequential fallback
    pub sequential_executions: usize,
}

/// Result of a committed batch.
#[derive(Debug)]
pub struct BatchOutput<R> {
    /// One response per input, in input order
    pub responses: Vec<TxnOutput<R>>,
    pub stats: ExecutionStats,
    /// Keys written or deleted by the commit
    pub keys_committed: usize,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

pub struct Executor<S, I, R> {
    config: ExecutorConfig,
    mv_store: MultiVersionStore<S>,
    scheduler: Scheduler,
    inputs: Vec<I>,
    responses: Vec<Mutex<Option<TxnOutput<R>>>>,
    executions: AtomicUsize,
    execution_aborts: AtomicUsize,
}

impl<S, I, R> Executor<S, I, R>
where
    S: BaseStore,
    I: Sync,
    R: TxnOutcome + Send,
{
    pub fn new(config: ExecutorConfig, base: Arc<S>, inputs: Vec<I>) -> Self {
        let num_txns = inputs.len();
        Executor {
            config,
            mv_store: MultiVersionStore::new(base, num_txns),
            scheduler: Scheduler::new(num_txns),
            responses: Self::empty_responses(num_txns),
            inputs,
            executions: AtomicUsize::new(0),
            execution_aborts: AtomicUsize::new(0),
        }
    }

    fn empty_responses(num_txns: usize) -> Vec<Mutex<Option<TxnOutput<R>>>> {
        std::iter::repeat_with(|| Mutex::new(None))
            .take(num_txns)
            .collect()
    }

    /// Reuse the executor and its multi-version store for a new batch.
    pub fn reset(&mut self, inputs: Vec<I>) {
        let num_txns = inputs.len();
        self.mv_store.reset(num_txns);
        self.scheduler = Scheduler::new(num_txns);
        self.responses = Self::empty_responses(num_txns);
        self.inputs = inputs;
        self.executions.store(0, Ordering::Relaxed);
        self.execution_aborts.store(0, Ordering::Relaxed);
    }

    pub fn num_txns(&self) -> usize {
        self.inputs.len()
    }

    pub fn mv_store(&self) -> &MultiVersionStore<S> {
        &self.mv_store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run the batch to completion and commit it.
    ///
    /// `execute` may be called several times per transaction. Only the
    /// incarnation that is finally validated determines the committed writes
    /// and the returned response.
    pub fn execute<F>(
        &mut self,
        execute: F,
        cancellation_token: &CancellationToken,
        parent_span: &Span,
    ) -> Result<BatchOutput<R>, ExecutorError>
    where
        F: Fn(TxnIndex, &mut VersionedStore<'_, S>, &I) -> Result<R, VersionedStoreError> + Sync,
    {
        let mut stats = ExecutionStats::default();
        self.run_rounds(&execute, cancellation_token, parent_span, &mut stats)?;
        self.run_sequential(&execute, cancellation_token, &mut stats)?;
        stats.executions = self.executions.load(Ordering::Relaxed);
        stats.execution_aborts = self.execution_aborts.load(Ordering::Relaxed);

        if cancellation_token.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        let responses = self.take_responses()?;
        let keys_committed = self.commit()?;

        Ok(BatchOutput {
            responses,
            stats,
            keys_committed,
        })
    }

    fn run_rounds<F>(
        &self,
        execute: &F,
        cancellation_token: &CancellationToken,
        parent_span: &Span,
        stats: &mut ExecutionStats,
    ) -> Result<(), ExecutorError>
    where
        F: Fn(TxnIndex, &mut VersionedStore<'_, S>, &I) -> Result<R, VersionedStoreError> + Sync,
    {
        while !self.scheduler.all_validated() && stats.rounds < self.config.max_rounds {
            if cancellation_token.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }
            stats.rounds += 1;

            let to_execute = self.scheduler.tasks_to_execute();
            self.run_pool(
                "execute",
                &to_execute,
                cancellation_token,
                parent_span,
                |worker_id, txn_idx| Ok(self.execute_task(worker_id, txn_idx, execute)),
            )?;

            let to_validate = self.scheduler.tasks_to_validate();
            let results = self.run_pool(
                "validate",
                &to_validate,
                cancellation_token,
                parent_span,
                |worker_id, txn_idx| self.validate_task(worker_id, txn_idx),
            )?;

            // Applied in index order so dependency checks see this pass's outcome.
            stats.validations += results.len();
            for (txn_idx, result) in results {
                if !self.apply_validation(txn_idx, &result) {
                    stats.validation_failures += 1;
                }
            }

            debug!(
                target: "occ",
                round = stats.rounds,
                executed = to_execute.len(),
                validated = to_validate.len(),
                first_non_validated = ?self.scheduler.first_non_validated(),
                "Finished round"
            );
        }
        Ok(())
    }

    /// Execute everything from the first non-validated transaction onward in
    /// index order. Each transaction only sees final writes, so no validation
    /// is needed.
    fn run_sequential<F>(
        &self,
        execute: &F,
        cancellation_token: &CancellationToken,
        stats: &mut ExecutionStats,
    ) -> Result<(), ExecutorError>
    where
        F: Fn(TxnIndex, &mut VersionedStore<'_, S>, &I) -> Result<R, VersionedStoreError> + Sync,
    {
        let suffix = self.scheduler.prepare_sequential();
        let Some(&first_txn_idx) = suffix.first() else {
            return Ok(());
        };
        stats.sequential_fallback = true;
        warn!(
            target: "occ",
            rounds = stats.rounds,
            first_txn_idx = first_txn_idx,
            remaining = suffix.len(),
            "Round cap reached, executing remaining transactions sequentially"
        );

        for txn_idx in suffix {
            if cancellation_token.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }
            if let Some(signal) = self.execute_task(0, txn_idx, execute) {
                return Err(ExecutorError::UnexpectedAbort {
                    txn_idx,
                    aborted_txn_idx: signal.dependent_txn_idx,
                });
            }
            self.scheduler.mark_validated(txn_idx);
            stats.sequential_executions += 1;
        }
        Ok(())
    }

    /// Hand `tasks` to a pool of scoped worker threads. Workers stop claiming
    /// tasks once the batch is cancelled or a task fails.
    fn run_pool<T, W>(
        &self,
        phase: &'static str,
        tasks: &[TxnIndex],
        cancellation_token: &CancellationToken,
        parent_span: &Span,
        work: W,
    ) -> Result<Vec<(TxnIndex, T)>, ExecutorError>
    where
        T: Send,
        W: Fn(usize, TxnIndex) -> Result<T, ExecutorError> + Sync,
    {
        let num_threads = self.config.workers_for(tasks.len());
        let cursor = AtomicUsize::new(0);
        let results = Mutex::new(Vec::with_capacity(tasks.len()));
        let first_error = Mutex::new(None);

        thread::scope(|s| {
            for worker_id in 0..num_threads {
                let worker_span = info_span!(
                    parent: parent_span,
                    "occ_worker",
                    worker_id = worker_id,
                    phase = phase
                );
                let (cursor, results, first_error, work) = (&cursor, &results, &first_error, &work);
                s.spawn(move || {
                    let _worker_guard = worker_span.entered();

                    while !cancellation_token.is_cancelled() && first_error.lock().is_none() {
                        let Some(&txn_idx) = tasks.get(cursor.fetch_add(1, Ordering::SeqCst)) else {
                            break;
                        };
                        match work(worker_id, txn_idx) {
                            Ok(output) => results.lock().push((txn_idx, output)),
                            Err(err) => {
                                first_error.lock().get_or_insert(err);
                            }
                        }
                    }

                    debug!(
                        target: "occ",
                        worker_id = worker_id,
                        phase = phase,
                        cancelled = cancellation_token.is_cancelled(),
                        "Worker thread exiting"
                    );
                });
            }
        });

        if let Some(err) = first_error.into_inner() {
            return Err(err);
        }
        if cancellation_token.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        let mut results = results.into_inner();
        results.sort_unstable_by_key(|(txn_idx, _)| *txn_idx);
        Ok(results)
    }

    /// Run one incarnation of `txn_idx`. Returns the abort signal if the
    /// incarnation read an estimate.
    fn execute_task<F>(
        &self,
        worker_id: usize,
        txn_idx: TxnIndex,
        execute: &F,
    ) -> Option<AbortSignal>
    where
        F: Fn(TxnIndex, &mut VersionedStore<'_, S>, &I) -> Result<R, VersionedStoreError> + Sync,
    {
        let version = self.scheduler.try_incarnate(txn_idx)?;
        let Version {
            txn_idx,
            incarnation,
        } = version;

        let tx_execute_span = info_span!(
            parent: Span::current(),
            "occ_txn_execute",
            txn_idx = txn_idx,
            incarnation = incarnation
        );
        let _tx_execute_guard = tx_execute_span.entered();

        debug!(
            target: "occ",
            worker_id = worker_id,
            txn_idx = txn_idx,
            incarnation = incarnation,
            "Starting execution task"
        );

        let mut store = VersionedStore::new(version, &self.mv_store);
        let input = &self.inputs[txn_idx as usize];
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute(txn_idx, &mut store, input)));
        let effects = store.into_effects();
        self.executions.fetch_add(1, Ordering::Relaxed);

        // Abort supersedes whatever the business logic returned.
        let aborted = effects.aborted.or(match &outcome {
            Ok(Err(VersionedStoreError::ReadAborted { aborted_txn_idx })) => {
                Some(AbortSignal::new(*aborted_txn_idx))
            }
            _ => None,
        });
        if let Some(signal) = aborted {
            self.execution_aborts.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "occ",
                worker_id = worker_id,
                txn_idx = txn_idx,
                incarnation = incarnation,
                aborted_txn_idx = signal.dependent_txn_idx,
                "Read aborted for transaction"
            );
            self.mv_store
                .set_estimated_writeset(txn_idx, incarnation, &effects.write_set);
            self.mv_store.clear_observations(txn_idx);
            self.scheduler.finish_execution(version, Some(signal));
            return Some(signal);
        }

        let (output, write_set) = match outcome {
            Ok(Ok(response)) => {
                let keep_writes = response.is_success()
                    || self.config.commit_policy == CommitPolicy::AllValidated;
                if !keep_writes {
                    debug!(
                        target: "occ",
                        txn_idx = txn_idx,
                        incarnation = incarnation,
                        "Transaction reported failure, writes discarded"
                    );
                }
                let write_set = if keep_writes {
                    effects.write_set
                } else {
                    WriteSet::new()
                };
                (TxnOutput::Completed(response), write_set)
            }
            Ok(Err(err)) => {
                warn!(
                    target: "occ",
                    txn_idx = txn_idx,
                    incarnation = incarnation,
                    error = %err,
                    "Error executing transaction"
                );
                (TxnOutput::Failed(err.to_string()), WriteSet::new())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(
                    target: "occ",
                    txn_idx = txn_idx,
                    incarnation = incarnation,
                    panic_message = %message,
                    "Transaction panicked, writes discarded"
                );
                (TxnOutput::Panicked(message), WriteSet::new())
            }
        };

        let wrote_new_location = self.mv_store.record_incarnation(
            version,
            effects.read_set,
            &write_set,
            effects.iterate_set,
        );
        *self.responses[txn_idx as usize].lock() = Some(output);
        self.scheduler.finish_execution(version, None);

        debug!(
            target: "occ",
            worker_id = worker_id,
            txn_idx = txn_idx,
            incarnation = incarnation,
            wrote_new_location = wrote_new_location,
            "Finished execution task"
        );
        None
    }

    fn validate_task(
        &self,
        worker_id: usize,
        txn_idx: TxnIndex,
    ) -> Result<ValidationResult, ExecutorError> {
        let incarnation = self.scheduler.incarnation(txn_idx);
        let tx_validate_span = info_span!(
            parent: Span::current(),
            "occ_txn_validate",
            txn_idx = txn_idx,
            incarnation = incarnation
        );
        let _tx_validate_guard = tx_validate_span.entered();

        let result = self.mv_store.validate_transaction_state(txn_idx)?;
        debug!(
            target: "occ",
            worker_id = worker_id,
            txn_idx = txn_idx,
            incarnation = incarnation,
            valid = result.is_valid(),
            "Finished validation task"
        );
        Ok(result)
    }

    /// Returns true if the transaction stays validated.
    fn apply_validation(&self, txn_idx: TxnIndex, result: &ValidationResult) -> bool {
        match self.scheduler.finish_validation(txn_idx, result) {
            ValidationDecision::Validated => true,
            decision => {
                warn!(
                    target: "occ",
                    txn_idx = txn_idx,
                    conflicts = ?result.conflicts(),
                    decision = ?decision,
                    "Conflict detected: transaction will be re-executed"
                );
                self.mv_store.convert_writes_to_estimates(txn_idx);
                self.mv_store.clear_observations(txn_idx);
                false
            }
        }
    }

    fn take_responses(&self) -> Result<Vec<TxnOutput<R>>, ExecutorError> {
        self.responses
            .iter()
            .enumerate()
            .map(|(txn_idx, slot)| {
                slot.lock().take().ok_or(ExecutorError::NotValidated {
                    txn_idx: txn_idx as TxnIndex,
                })
            })
            .collect()
    }

    /// Apply every validated write set to the base store in one batch.
    fn commit(&self) -> Result<usize, ExecutorError> {
        if let Some(txn_idx) = self.scheduler.first_non_validated() {
            return Err(ExecutorError::NotValidated { txn_idx });
        }
        let batch = self.mv_store.commit_batch();
        let keys_committed = batch.len();
        if !batch.is_empty() {
            self.mv_store.base().write_batch(batch)?;
        }
        Ok(keys_committed)
    }
}
