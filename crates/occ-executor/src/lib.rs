//! Optimistic parallel execution of ordered task batches.
//!
//! Tasks run speculatively on worker threads against a multi-version view of
//! an ordered key/value store. Conflicts are detected by validating each
//! task's reads and range scans, conflicting tasks are re-executed, and the
//! final writes are committed in task order with one atomic write batch. The
//! outcome is identical to executing the batch sequentially.

pub mod args;
pub mod batch;
pub mod block_stm;

pub use args::{CommitPolicy, ExecutorConfig, ParallelExecutionArgs};
pub use batch::BatchExecutor;
pub use block_stm::{
    BaseStore, BaseStoreError, BatchOutput, ExecutionStats, ExecutorError, MemoryStore,
    TxnOutcome, TxnOutput, VersionedStore, VersionedStoreError, WriteBatch,
};
