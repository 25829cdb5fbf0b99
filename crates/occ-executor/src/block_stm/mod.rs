//! Block-STM style optimistic parallel execution over an ordered key/value store.
//!
//! Every transaction of a batch runs speculatively against a multi-version
//! view of the store. The executor then:
//!
//! 1. Tracks the reads, writes and range scans of each incarnation
//! 2. Validates reads by value, replaying scans to catch phantoms
//! 3. Turns the writes of invalid transactions into estimates and re-executes them
//! 4. Falls back to sequential execution once the round cap is reached
//! 5. Commits every validated write set to the base store in one batch
//!
//! # Architecture
//!
//! - [`types`]: Core types (TxnIndex, Version, read/write sets, TxnOutput)
//! - [`base_store`]: Durable backend trait and the in-memory backend
//! - [`mv_store`]: Multi-version store shared by all transactions of a batch
//! - [`merge_iter`]: Ordered merge of base scans with speculative writes
//! - [`db_adapter`]: Per-incarnation store view handed to business logic
//! - [`scheduler`]: Transaction status, incarnations and dependencies
//! - [`executor`]: Round loop, worker pools and the final commit

pub mod base_store;
pub mod db_adapter;
pub mod executor;
pub mod merge_iter;
pub mod mv_store;
pub mod scheduler;
pub mod types;


// Re-export commonly used types
pub use base_store::{BaseStore, BaseStoreError, KvIter, MemoryStore, WriteBatch};
pub use db_adapter::{VersionedIterator, VersionedStore, VersionedStoreError};
pub use executor::{BatchOutput, ExecutionStats, Executor, ExecutorError};
pub use mv_store::MultiVersionStore;
pub use scheduler::{Scheduler, ValidationDecision};
pub use types::{
    AbortSignal, ExecutionStatus, Incarnation, Key, ReadResult, ReadSet, TxnIndex, TxnOutcome,
    TxnOutput, ValidationResult, Value, Version, WriteSet,
};
