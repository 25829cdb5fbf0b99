//! Task-local store for parallel execution
//!
//! This module provides a `VersionedStore` that business logic reads and writes
//! through while a transaction executes speculatively.
//!
//! # How It Works
//!
//! 1. Reads of keys the transaction already wrote are served from its own write set
//! 2. Otherwise the MultiVersionStore resolves the read for this transaction's index
//! 3. Every resolved value is recorded in the read set for validation
//! 4. Range scans record the keys they hand out and where they stopped
//! 5. All writes go to a local WriteSet (installed in the MultiVersionStore after execution)
//!
//! Reading an estimate fails the operation with
//! [`VersionedStoreError::ReadAborted`] and latches the abort, so an execute
//! function that swallows the error is still reported as aborted.

use crate::block_stm::{
    base_store::{BaseStore, BaseStoreError},
    merge_iter::MergeIterator,
    mv_store::MultiVersionStore,
    types::{
        AbortSignal, Incarnation, IterationTracker, Key, ReadResult, ReadSet, TaskEffects,
        TxnIndex, Value, Version, WriteSet,
    },
};
use derive_more::Debug;
use tracing::trace;

/// Error type for versioned store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionedStoreError {
    /// Read encountered an estimate of an unfinished transaction - abort and retry
    #[error("read from aborted transaction {aborted_txn_idx}")]
    ReadAborted { aborted_txn_idx: TxnIndex },
    /// Base store error
    #[error(transparent)]
    BaseStore(#[from] BaseStoreError),
}

impl VersionedStoreError {
    pub fn is_abort(&self) -> bool {
        matches!(self, VersionedStoreError::ReadAborted { .. })
    }
}

impl From<AbortSignal> for VersionedStoreError {
    fn from(signal: AbortSignal) -> Self {
        VersionedStoreError::ReadAborted {
            aborted_txn_idx: signal.dependent_txn_idx,
        }
    }
}

/// A transaction's view of the batch state.
#[derive(Debug)]
pub struct VersionedStore<'a, S> {
    /// Transaction index this store is for
    txn_idx: TxnIndex,
    incarnation: Incarnation,
    /// The shared multi-version store
    #[debug(skip)]
    mv_store: &'a MultiVersionStore<S>,
    /// Read set for validation
    read_set: ReadSet,
    /// Buffered writes
    write_set: WriteSet,
    /// Traces of finished range scans
    iterate_set: Vec<IterationTracker>,
    /// First estimate observed, if any
    aborted: Option<AbortSignal>,
}

impl<'a, S: BaseStore> VersionedStore<'a, S> {
    /// Create a new store for one incarnation of a transaction.
    pub fn new(version: Version, mv_store: &'a MultiVersionStore<S>) -> Self {
        Self {
            txn_idx: version.txn_idx,
            incarnation: version.incarnation,
            mv_store,
            read_set: ReadSet::new(),
            write_set: WriteSet::new(),
            iterate_set: Vec::new(),
            aborted: None,
        }
    }

    /// Get the transaction index.
    pub fn txn_idx(&self) -> TxnIndex {
        self.txn_idx
    }

    /// The estimate this incarnation ran into, if any.
    pub fn aborted(&self) -> Option<AbortSignal> {
        self.aborted
    }

    /// Writes buffered so far.
    pub fn write_set(&self) -> &WriteSet {
        &self.write_set
    }

    /// Consume the store, yielding everything the incarnation produced.
    pub fn into_effects(self) -> TaskEffects {
        TaskEffects {
            read_set: self.read_set,
            write_set: self.write_set,
            iterate_set: self.iterate_set,
            aborted: self.aborted,
        }
    }

    fn abort(&mut self, aborted_txn_idx: TxnIndex) -> VersionedStoreError {
        trace!(
            txn_idx = self.txn_idx,
            incarnation = self.incarnation,
            aborted_txn_idx = aborted_txn_idx,
            "read hit estimate"
        );
        let signal = *self
            .aborted
            .get_or_insert(AbortSignal::new(aborted_txn_idx));
        VersionedStoreError::ReadAborted {
            aborted_txn_idx: signal.dependent_txn_idx,
        }
    }

    fn add_to_reads(&mut self, key: &[u8], value: Option<Value>) {
        self.read_set
            .entry(Key::copy_from_slice(key))
            .or_default()
            .push(value);
    }

    /// Read a key as this transaction would see it in sequential order.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Value>, VersionedStoreError> {
        if let Some(local) = self.write_set.get(key) {
            return Ok(local.clone());
        }
        match self.mv_store.get(key, self.txn_idx)? {
            ReadResult::Estimate { version, .. } => Err(self.abort(version.txn_idx)),
            result => {
                let value = result.value().cloned();
                self.add_to_reads(key, value.clone());
                Ok(value)
            }
        }
    }

    pub fn has(&mut self, key: &[u8]) -> Result<bool, VersionedStoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Buffer a write.
    pub fn set(
        &mut self,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<(), VersionedStoreError> {
        self.write_set.insert(key.into(), Some(value.into()));
        Ok(())
    }

    /// Buffer a deletion.
    pub fn delete(&mut self, key: impl Into<Key>) -> Result<(), VersionedStoreError> {
        self.write_set.insert(key.into(), None);
        Ok(())
    }

    /// Ascending scan of `[start, end)`.
    pub fn iterator(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<VersionedIterator<'_, 'a, S>, VersionedStoreError> {
        self.scan(start, end, true)
    }

    /// Descending scan of `[start, end)`.
    pub fn reverse_iterator(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<VersionedIterator<'_, 'a, S>, VersionedStoreError> {
        self.scan(start, end, false)
    }

    fn scan(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<VersionedIterator<'_, 'a, S>, VersionedStoreError> {
        let mv_store = self.mv_store;
        let inner = mv_store.iterator(self.txn_idx, start, end, ascending, &self.write_set)?;
        let tracker = IterationTracker::new(
            start.map(Key::copy_from_slice),
            end.map(Key::copy_from_slice),
            ascending,
            self.write_set.clone(),
        );
        Ok(VersionedIterator {
            store: self,
            inner,
            tracker: Some(tracker),
            exhausted: false,
            fused: false,
        })
    }
}

/// Range scan handed to business logic.
///
/// Holds the task-local store mutably, so the task cannot write while a scan
/// is open. The scan's trace is appended to the store's iterate set on drop.
#[derive(Debug)]
pub struct VersionedIterator<'s, 'a, S: BaseStore> {
    #[debug(skip)]
    store: &'s mut VersionedStore<'a, S>,
    #[debug(skip)]
    inner: MergeIterator<'a>,
    tracker: Option<IterationTracker>,
    exhausted: bool,
    fused: bool,
}

impl<S: BaseStore> Iterator for VersionedIterator<'_, '_, S> {
    type Item = Result<(Key, Value), VersionedStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match self.inner.next() {
            None => {
                self.exhausted = true;
                self.fused = true;
                None
            }
            Some(Err(signal)) => {
                self.fused = true;
                Some(Err(self.store.abort(signal.dependent_txn_idx)))
            }
            Some(Ok((key, value))) => {
                if let Some(tracker) = self.tracker.as_mut() {
                    tracker.visit(key.clone());
                }
                // Values served from other writers or the base are validated like point reads
                if !self.store.write_set.contains_key(&key) {
                    self.store.add_to_reads(&key, Some(value.clone()));
                }
                Some(Ok((key, value)))
            }
        }
    }
}

impl<S: BaseStore> Drop for VersionedIterator<'_, '_, S> {
    fn drop(&mut self) {
        if let Some(mut tracker) = self.tracker.take() {
            tracker.finish(self.exhausted);
            self.store.iterate_set.push(tracker);
        }
    }
}
