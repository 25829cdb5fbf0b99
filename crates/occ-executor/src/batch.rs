use std::{path::Path, sync::Arc, time::Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Span};

use crate::{
    args::{ExecutorConfig, ParallelExecutionArgs},
    block_stm::{
        base_store::BaseStore,
        db_adapter::{VersionedStore, VersionedStoreError},
        executor::{BatchOutput, Executor, ExecutorError},
        types::{TxnIndex, TxnOutcome},
    },
};

/// Runs ordered batches of tasks against one base store.
///
/// Each call to [`BatchExecutor::execute_batch`] executes its tasks
/// optimistically in parallel and commits the validated writes in a single
/// write batch. Batches never overlap: the next batch sees everything the
/// previous one committed.
#[derive(Debug, Clone)]
pub struct BatchExecutor<S> {
    /// Pool size, round cap and commit policy.
    pub config: ExecutorConfig,
    /// Backend read as the base layer and written by the commit.
    pub store: Arc<S>,
    /// Marker to check whether the executor has been cancelled.
    pub cancel: CancellationToken,
}

impl<S: BaseStore> BatchExecutor<S> {
    pub fn new(config: ExecutorConfig, store: Arc<S>) -> Self {
        Self {
            config,
            store,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_args(args: &ParallelExecutionArgs, store: Arc<S>) -> Self {
        Self::new(ExecutorConfig::from(args), store)
    }

    /// Build an executor from a TOML config file.
    pub fn from_config_file(path: &Path, store: Arc<S>) -> anyhow::Result<Self> {
        Ok(Self::new(ExecutorConfig::from_file(path)?, store))
    }

    pub fn with_cancel(self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Cancel the running batch and every later one.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Execute `inputs` in order and commit the result.
    ///
    /// `execute` may run more than once per input and must derive its
    /// effects only from the store it is handed. Responses are returned in
    /// input order. On error nothing is committed.
    pub fn execute_batch<I, R, F>(
        &self,
        inputs: Vec<I>,
        execute: F,
    ) -> Result<BatchOutput<R>, ExecutorError>
    where
        I: Sync,
        R: TxnOutcome + Send,
        F: Fn(TxnIndex, &mut VersionedStore<'_, S>, &I) -> Result<R, VersionedStoreError> + Sync,
    {
        let num_txns = inputs.len();
        let num_threads = self.config.workers_for(num_txns);

        // Capture parent span for cross-thread propagation
        let parent_span = Span::current();
        let batch_span = info_span!(
            parent: &parent_span,
            "occ_batch",
            num_txns = num_txns,
            num_threads = num_threads
        );
        let _batch_guard = batch_span.enter();

        info!(
            target: "occ",
            num_txns = num_txns,
            num_threads = num_threads,
            max_rounds = self.config.max_rounds,
            commit_policy = %self.config.commit_policy,
            "Executing batch"
        );

        let started = Instant::now();
        let mut executor = Executor::new(self.config.clone(), Arc::clone(&self.store), inputs);
        let result = executor.execute(execute, &self.cancel, &batch_span);

        match &result {
            Ok(output) => {
                let stats = &output.stats;
                info!(
                    target: "occ",
                    num_txns = num_txns,
                    rounds = stats.rounds,
                    executions = stats.executions,
                    execution_aborts = stats.execution_aborts,
                    validation_failures = stats.validation_failures,
                    sequential_fallback = stats.sequential_fallback,
                    keys_committed = output.keys_committed,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "Batch committed"
                );
            }
            Err(err) => {
                warn!(
                    target: "occ",
                    num_txns = num_txns,
                    error = %err,
                    "Batch failed, nothing committed"
                );
            }
        }
        result
    }
}
