//! Core types for the optimistic parallel executor.
//!
//! This module defines the fundamental types used throughout the implementation:
//! - Transaction indexing and versioning
//! - Byte-string keys and values, read/write sets
//! - Iteration traces replayed during validation
//! - Abort signals raised when a reader hits an estimate

use bytes::Bytes;
use derive_more::Display;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// Index of a transaction within a batch (0-based).
pub type TxnIndex = u32;

/// Incarnation number - incremented each time a transaction is re-executed.
/// Starts at 0 for the first execution.
pub type Incarnation = u32;

/// State keys are ordered byte strings.
pub type Key = Bytes;

/// State values are opaque byte strings.
pub type Value = Bytes;

/// Buffered writes of one incarnation. `None` marks a deletion.
///
/// Ordered so that installing, replaying and committing a write set never
/// depends on hash iteration order.
pub type WriteSet = BTreeMap<Key, Option<Value>>;

/// Every value observed per key during one incarnation, in observation order.
/// `None` means the key was observed as absent.
pub type ReadSet = BTreeMap<Key, Vec<Option<Value>>>;

/// Status of a transaction in the scheduler.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    /// Waiting to be picked up by an execution worker.
    #[display("Pending")]
    Pending,
    /// An execution worker is running the business logic.
    #[display("Executing")]
    Executing,
    /// The incarnation finished and its writes are installed.
    #[display("Executed")]
    Executed,
    /// The incarnation was interrupted by an estimate read.
    #[display("Aborted")]
    Aborted,
    /// The latest validation pass found the incarnation consistent.
    #[display("Validated")]
    Validated,
    /// Invalid, parked until its dependencies are validated.
    #[display("Waiting")]
    Waiting,
}

impl ExecutionStatus {
    /// Returns true if the status carries a finished incarnation that can be validated.
    pub fn is_validatable(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Executed | ExecutionStatus::Aborted | ExecutionStatus::Validated
        )
    }
}

/// A version uniquely identifies a specific execution of a transaction.
/// Consists of (transaction index, incarnation number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub txn_idx: TxnIndex,
    pub incarnation: Incarnation,
}

impl Version {
    pub fn new(txn_idx: TxnIndex, incarnation: Incarnation) -> Self {
        Self {
            txn_idx,
            incarnation,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(txn={}, inc={})", self.txn_idx, self.incarnation)
    }
}

/// Raised when a reader observes an estimate written by an unfinished transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AbortSignal {
    /// The lower transaction whose incarnation is not final yet.
    pub dependent_txn_idx: TxnIndex,
}

impl AbortSignal {
    pub fn new(dependent_txn_idx: TxnIndex) -> Self {
        Self { dependent_txn_idx }
    }
}

/// Result of resolving a key for a reader against the multi-version store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Written (or deleted, when `value` is `None`) by an earlier transaction.
    Value {
        value: Option<Value>,
        version: Version,
    },
    /// The highest earlier writer only holds an estimate. The value is
    /// provisional and the reader must abort.
    Estimate {
        value: Option<Value>,
        version: Version,
    },
    /// No earlier transaction wrote the key; this is the base store value.
    Base { value: Option<Value> },
}

impl ReadResult {
    /// The value a reader would observe.
    pub fn value(&self) -> Option<&Value> {
        match self {
            ReadResult::Value { value, .. }
            | ReadResult::Estimate { value, .. }
            | ReadResult::Base { value } => value.as_ref(),
        }
    }

    /// The transaction that produced the value, `None` for the base store.
    pub fn writer(&self) -> Option<TxnIndex> {
        match self {
            ReadResult::Value { version, .. } | ReadResult::Estimate { version, .. } => {
                Some(version.txn_idx)
            }
            ReadResult::Base { .. } => None,
        }
    }

    pub fn is_estimate(&self) -> bool {
        matches!(self, ReadResult::Estimate { .. })
    }
}

/// Recorded trace of one range scan, replayed during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationTracker {
    /// Inclusive lower bound, `None` for unbounded.
    pub start: Option<Key>,
    /// Exclusive upper bound, `None` for unbounded.
    pub end: Option<Key>,
    pub ascending: bool,
    /// Keys returned to the business logic, in order.
    pub iterated_keys: Vec<Key>,
    /// Last key returned before the iterator was dropped without being exhausted.
    pub early_stop_key: Option<Key>,
    /// Whether the scan observed the end of its range.
    pub exhausted: bool,
    /// The task's own buffered writes when the iterator was created.
    pub write_set: WriteSet,
}

impl IterationTracker {
    pub fn new(start: Option<Key>, end: Option<Key>, ascending: bool, write_set: WriteSet) -> Self {
        Self {
            start,
            end,
            ascending,
            iterated_keys: Vec::new(),
            early_stop_key: None,
            exhausted: false,
            write_set,
        }
    }

    /// Record a key returned by the scan.
    pub fn visit(&mut self, key: Key) {
        self.iterated_keys.push(key);
    }

    /// Seal the trace when the iterator is dropped.
    pub fn finish(&mut self, exhausted: bool) {
        self.exhausted = exhausted;
        self.early_stop_key = if exhausted {
            None
        } else {
            self.iterated_keys.last().cloned()
        };
    }
}

/// Everything a finished incarnation produced besides its response.
#[derive(Debug, Clone, Default)]
pub struct TaskEffects {
    pub read_set: ReadSet,
    pub write_set: WriteSet,
    pub iterate_set: Vec<IterationTracker>,
    /// Set when the incarnation observed an estimate, even if the business
    /// logic swallowed the error.
    pub aborted: Option<AbortSignal>,
}

/// Outcome of validating a transaction's recorded observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    /// At least one observation no longer holds. `conflicts` lists the
    /// lower transactions responsible, sorted and de-duplicated.
    Invalid { conflicts: Vec<TxnIndex> },
}

impl ValidationResult {
    pub fn invalid(conflicts: BTreeSet<TxnIndex>) -> Self {
        ValidationResult::Invalid {
            conflicts: conflicts.into_iter().collect(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn conflicts(&self) -> &[TxnIndex] {
        match self {
            ValidationResult::Valid => &[],
            ValidationResult::Invalid { conflicts } => conflicts,
        }
    }
}

/// Lets the executor read the business-level success flag of a response.
pub trait TxnOutcome {
    /// Whether the task considers itself successful. Failed tasks may have
    /// their writes withheld depending on the commit policy.
    fn is_success(&self) -> bool {
        true
    }
}

impl TxnOutcome for () {}

impl TxnOutcome for bool {
    fn is_success(&self) -> bool {
        *self
    }
}

impl<T, E> TxnOutcome for Result<T, E> {
    fn is_success(&self) -> bool {
        self.is_ok()
    }
}

/// Final per-task response returned in batch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutput<R> {
    /// The business logic returned a response.
    Completed(R),
    /// The business logic returned a non-abort store error.
    Failed(String),
    /// The business logic panicked; the panic was contained to this task.
    Panicked(String),
}

impl<R: TxnOutcome> TxnOutput<R> {
    pub fn is_success(&self) -> bool {
        match self {
            TxnOutput::Completed(response) => response.is_success(),
            TxnOutput::Failed(_) | TxnOutput::Panicked(_) => false,
        }
    }
}

impl<R> TxnOutput<R> {
    pub fn response(&self) -> Option<&R> {
        match self {
            TxnOutput::Completed(response) => Some(response),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let v1 = Version::new(0, 0);
        let v2 = Version::new(0, 1);
        let v3 = Version::new(1, 0);

        assert!(v1 < v2);
        assert!(v2 < v3);
        assert!(v1 < v3);
        assert_eq!(v2.to_string(), "(txn=0, inc=1)");
    }

    #[test]
    fn test_read_result_accessors() {
        let value = Bytes::from_static(b"v");
        let read = ReadResult::Estimate {
            value: Some(value.clone()),
            version: Version::new(3, 1),
        };
        assert!(read.is_estimate());
        assert_eq!(read.writer(), Some(3));
        assert_eq!(read.value(), Some(&value));

        let base = ReadResult::Base { value: None };
        assert_eq!(base.writer(), None);
        assert_eq!(base.value(), None);
    }

    #[test]
    fn test_tracker_early_stop() {
        let mut tracker = IterationTracker::new(None, None, true, WriteSet::new());
        tracker.visit(Bytes::from_static(b"a"));
        tracker.visit(Bytes::from_static(b"b"));
        tracker.finish(false);
        assert_eq!(tracker.early_stop_key, Some(Bytes::from_static(b"b")));

        let mut exhausted = IterationTracker::new(None, None, true, WriteSet::new());
        exhausted.visit(Bytes::from_static(b"a"));
        exhausted.finish(true);
        assert_eq!(exhausted.early_stop_key, None);
        assert!(exhausted.exhausted);
    }

    #[test]
    fn test_output_success() {
        assert!(TxnOutput::Completed(()).is_success());
        assert!(!TxnOutput::Completed(false).is_success());
        assert!(!TxnOutput::<()>::Panicked("boom".into()).is_success());
        assert_eq!(ExecutionStatus::Waiting.to_string(), "Waiting");
    }
}
