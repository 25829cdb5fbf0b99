//! Multi-Version Store
//!
//! The MultiVersionStore is the central data structure for parallel execution. It
//! stores the speculative writes of every transaction in the batch, answers "what
//! would transaction `i` observe" and validates whether a transaction's recorded
//! observations still hold.
//!
//! # Key Features
//!
//! - **Versioned Storage**: Each key keeps one entry per writing transaction
//! - **Estimates**: Writes of unfinished incarnations are flagged so readers abort
//! - **Value Validation**: Read sets are re-resolved and compared by value
//! - **Iterator Replay**: Range scans are replayed and compared key by key
//! - **Concurrent Access**: An ordered key index behind an `RwLock`, with one
//!   `RwLock` per version list for fine-grained read/write

use crate::block_stm::{
    base_store::{is_empty_range, range_bounds, BaseStore, BaseStoreError, KvIter, WriteBatch},
    merge_iter::{layer_write_set, MergeIterator, Overlay, OverlayEntry},
    types::{
        Incarnation, IterationTracker, Key, ReadResult, ReadSet, TxnIndex, ValidationResult,
        Value, Version, WriteSet,
    },
};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::trace;

/// Entry for a single transaction's write to a key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct VersionedEntry {
    /// The incarnation that wrote this value
    incarnation: Incarnation,
    /// The written value, `None` for a deletion
    value: Option<Value>,
    /// Whether the incarnation that wrote this is not final
    estimate: bool,
}

/// Versions of one key, sorted by writer so "latest before" is a range query.
type VersionList = BTreeMap<TxnIndex, VersionedEntry>;

/// Everything the store remembers about one transaction's latest incarnation.
#[derive(Debug, Default)]
struct TxnRecord {
    written_keys: BTreeSet<Key>,
    read_set: ReadSet,
    iterate_set: Vec<IterationTracker>,
}

/// Multi-version store for one batch.
///
/// Readers take the key-index lock shared and a version-list lock shared;
/// writers take the key-index lock shared and a version-list lock exclusively.
/// Only creating a key takes the key-index lock exclusively. [`Self::reset`]
/// needs `&mut self`, so no reader or writer can hold a reference into the
/// generation being torn down.
#[derive(derive_more::Debug)]
pub struct MultiVersionStore<S> {
    /// The durable layer every read falls back to
    #[debug(skip)]
    base: Arc<S>,
    /// Map from key to its version list.
    data: RwLock<BTreeMap<Key, RwLock<VersionList>>>,
    /// Per-transaction write keys and observations.
    txn_records: Vec<RwLock<TxnRecord>>,
    /// Bumped by every reset.
    generation: u64,
}

impl<S: BaseStore> MultiVersionStore<S> {
    /// Create a new store for a batch with the given number of transactions.
    pub fn new(base: Arc<S>, num_txns: usize) -> Self {
        Self {
            base,
            data: RwLock::new(BTreeMap::new()),
            txn_records: Self::empty_records(num_txns),
            generation: 0,
        }
    }

    fn empty_records(num_txns: usize) -> Vec<RwLock<TxnRecord>> {
        std::iter::repeat_with(|| RwLock::new(TxnRecord::default()))
            .take(num_txns)
            .collect()
    }

    pub fn base(&self) -> &S {
        &self.base
    }

    pub fn num_txns(&self) -> usize {
        self.txn_records.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drop every version and observation and size the store for a new batch.
    pub fn reset(&mut self, num_txns: usize) {
        self.data = RwLock::new(BTreeMap::new());
        self.txn_records = Self::empty_records(num_txns);
        self.generation += 1;
        trace!(
            generation = self.generation,
            num_txns = num_txns,
            "MultiVersionStore reset"
        );
    }

    fn record(&self, txn_idx: TxnIndex) -> &RwLock<TxnRecord> {
        &self.txn_records[txn_idx as usize]
    }

    /// Create empty version lists for keys seen for the first time.
    fn ensure_keys<'k>(&self, keys: impl Iterator<Item = &'k Key> + Clone) {
        let missing = {
            let data = self.data.read();
            keys.clone().any(|key| !data.contains_key(key))
        };
        if missing {
            let mut data = self.data.write();
            for key in keys {
                data.entry(key.clone()).or_default();
            }
        }
    }

    /// Install `write_set` as the writer's current incarnation.
    ///
    /// In final mode keys the writer no longer writes are removed. In estimate
    /// mode they are kept and flagged as estimates as well.
    fn install(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        write_set: &WriteSet,
        estimate: bool,
    ) -> bool {
        let mut record = self.record(txn_idx).write();
        self.ensure_keys(write_set.keys());

        let data = self.data.read();
        for stale in record
            .written_keys
            .iter()
            .filter(|key| !write_set.contains_key(*key))
        {
            if let Some(versions) = data.get(stale) {
                let mut versions = versions.write();
                if estimate {
                    if let Some(entry) = versions.get_mut(&txn_idx) {
                        entry.estimate = true;
                    }
                } else {
                    versions.remove(&txn_idx);
                }
            }
        }
        for (key, value) in write_set {
            trace!(
                txn_idx = txn_idx,
                incarnation = incarnation,
                key = ?key,
                estimate = estimate,
                "MultiVersionStore write"
            );
            if let Some(versions) = data.get(key) {
                versions.write().insert(
                    txn_idx,
                    VersionedEntry {
                        incarnation,
                        value: value.clone(),
                        estimate,
                    },
                );
            }
        }

        let wrote_new_location = write_set
            .keys()
            .any(|key| !record.written_keys.contains(key));
        if estimate {
            record.written_keys.extend(write_set.keys().cloned());
        } else {
            record.written_keys = write_set.keys().cloned().collect();
        }
        wrote_new_location
    }

    /// Install a finished incarnation's writes, replacing the previous
    /// incarnation's entries. Returns true if a key not written before was written.
    pub fn set_writeset(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        write_set: &WriteSet,
    ) -> bool {
        self.install(txn_idx, incarnation, write_set, false)
    }

    /// Install placeholder writes for an incarnation that did not finish.
    /// Keys written by earlier incarnations stay behind as estimates too.
    pub fn set_estimated_writeset(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        write_set: &WriteSet,
    ) {
        self.install(txn_idx, incarnation, write_set, true);
    }

    /// Flag every entry of `txn_idx` as an estimate.
    pub fn convert_writes_to_estimates(&self, txn_idx: TxnIndex) {
        let record = self.record(txn_idx).read();
        let data = self.data.read();
        for location in record.written_keys.iter() {
            let versions = data.get(location);
            debug_assert!(
                versions.is_some(),
                "written_keys should only contain keys that have a version list"
            );
            let Some(versions) = versions else {
                continue;
            };
            if let Some(entry) = versions.write().get_mut(&txn_idx) {
                entry.estimate = true;
                trace!(
                    txn_idx = txn_idx,
                    incarnation = entry.incarnation,
                    key = ?location,
                    "MultiVersionStore estimate"
                );
            }
        }
    }

    /// Discard every entry and observation of `txn_idx`.
    pub fn invalidate(&self, txn_idx: TxnIndex) {
        let mut record = self.record(txn_idx).write();
        let data = self.data.read();
        for location in std::mem::take(&mut record.written_keys) {
            if let Some(versions) = data.get(&location) {
                versions.write().remove(&txn_idx);
            }
        }
        record.read_set.clear();
        record.iterate_set.clear();
    }

    /// Record a finished incarnation: its writes plus what it observed.
    pub fn record_incarnation(
        &self,
        version: Version,
        read_set: ReadSet,
        write_set: &WriteSet,
        iterate_set: Vec<IterationTracker>,
    ) -> bool {
        let wrote_new_location = self.set_writeset(version.txn_idx, version.incarnation, write_set);
        let mut record = self.record(version.txn_idx).write();
        record.read_set = read_set;
        record.iterate_set = iterate_set;
        wrote_new_location
    }

    /// Forget what `txn_idx` observed, keeping its writes.
    pub fn clear_observations(&self, txn_idx: TxnIndex) {
        let mut record = self.record(txn_idx).write();
        record.read_set.clear();
        record.iterate_set.clear();
    }

    /// Get the last read set recorded for a transaction.
    pub fn read_set(&self, txn_idx: TxnIndex) -> ReadSet {
        self.record(txn_idx).read().read_set.clone()
    }

    /// Keys the latest incarnation of `txn_idx` wrote, in ascending order.
    pub fn written_keys(&self, txn_idx: TxnIndex) -> Vec<Key> {
        self.record(txn_idx)
            .read()
            .written_keys
            .iter()
            .cloned()
            .collect()
    }

    /// The writes `txn_idx` currently has installed, estimates excluded.
    pub fn write_set(&self, txn_idx: TxnIndex) -> WriteSet {
        let record = self.record(txn_idx).read();
        let data = self.data.read();
        record
            .written_keys
            .iter()
            .filter_map(|key| {
                let versions = data.get(key)?.read();
                let entry = versions.get(&txn_idx).filter(|entry| !entry.estimate)?;
                Some((key.clone(), entry.value.clone()))
            })
            .collect()
    }

    /// Latest entry written by a transaction with index < `reader_txn_idx`.
    pub fn read(&self, key: &[u8], reader_txn_idx: TxnIndex) -> Option<ReadResult> {
        let data = self.data.read();
        let versions = data.get(key)?.read();
        let (&writer_txn_idx, entry) = versions.range(..reader_txn_idx).next_back()?;
        let version = Version::new(writer_txn_idx, entry.incarnation);
        let value = entry.value.clone();
        Some(if entry.estimate {
            ReadResult::Estimate { value, version }
        } else {
            ReadResult::Value { value, version }
        })
    }

    /// What `reader_txn_idx` observes for `key`, falling back to the base store.
    pub fn get(&self, key: &[u8], reader_txn_idx: TxnIndex) -> Result<ReadResult, BaseStoreError> {
        let result = match self.read(key, reader_txn_idx) {
            Some(result) => result,
            None => ReadResult::Base {
                value: self.base.get(key)?,
            },
        };
        trace!(
            reader_txn_idx = reader_txn_idx,
            key = ?key,
            result = ?result,
            "MultiVersionStore read"
        );
        Ok(result)
    }

    /// Latest entry before `reader_txn_idx` for every key in `[start, end)`.
    pub fn collect_overlay(
        &self,
        reader_txn_idx: TxnIndex,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Overlay {
        let mut overlay = Overlay::new();
        if is_empty_range(start, end) {
            return overlay;
        }
        let data = self.data.read();
        for (key, versions) in data.range::<[u8], _>(range_bounds(start, end)) {
            let versions = versions.read();
            if let Some((&writer, entry)) = versions.range(..reader_txn_idx).next_back() {
                overlay.insert(
                    key.clone(),
                    OverlayEntry {
                        value: entry.value.clone(),
                        writer: Some(writer),
                        estimate: entry.estimate,
                    },
                );
            }
        }
        overlay
    }

    /// MVCC-visible scan of `[start, end)` for `reader_txn_idx`, with the
    /// reader's own buffered writes layered on top.
    pub fn iterator(
        &self,
        reader_txn_idx: TxnIndex,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        own_writes: &WriteSet,
    ) -> Result<MergeIterator<'_>, BaseStoreError> {
        let mut overlay = self.collect_overlay(reader_txn_idx, start, end);
        layer_write_set(&mut overlay, own_writes, start, end);
        let base: KvIter<'_> = if is_empty_range(start, end) {
            Box::new(std::iter::empty())
        } else if ascending {
            self.base.iterator(start, end)?
        } else {
            self.base.reverse_iterator(start, end)?
        };
        Ok(MergeIterator::new(base, overlay, ascending))
    }

    /// Re-resolve every recorded read and compare by value.
    pub fn validate_read_set(&self, txn_idx: TxnIndex) -> Result<ValidationResult, BaseStoreError> {
        let record = self.record(txn_idx).read();
        let mut valid = true;
        let mut conflicts = BTreeSet::new();
        for (key, observed) in &record.read_set {
            let current = self.get(key, txn_idx)?;
            if current.is_estimate() {
                valid = false;
                conflicts.extend(current.writer());
                continue;
            }
            if observed.iter().any(|value| value.as_ref() != current.value()) {
                valid = false;
                conflicts.extend(current.writer());
            }
        }
        Ok(if valid {
            ValidationResult::Valid
        } else {
            ValidationResult::invalid(conflicts)
        })
    }

    /// Replay one recorded scan. Returns `None` if the trace still holds,
    /// otherwise every writer touched by the replay.
    fn replay_iteration(
        &self,
        txn_idx: TxnIndex,
        tracker: &IterationTracker,
    ) -> Result<Option<BTreeSet<TxnIndex>>, BaseStoreError> {
        // Nothing was pulled from the scan, so nothing was observed.
        if !tracker.exhausted && tracker.iterated_keys.is_empty() {
            return Ok(None);
        }

        let mut iter = self.iterator(
            txn_idx,
            tracker.start.as_deref(),
            tracker.end.as_deref(),
            tracker.ascending,
            &tracker.write_set,
        )?;
        let mut visited = Vec::with_capacity(tracker.iterated_keys.len());
        let mut exhausted = false;
        let mut hit_estimate = false;
        loop {
            match iter.next() {
                None => {
                    exhausted = true;
                    break;
                }
                Some(Err(_)) => {
                    hit_estimate = true;
                    break;
                }
                Some(Ok((key, _))) => {
                    visited.push(key);
                    // An early-stopped scan only observed up to its stop key.
                    let reached_stop =
                        !tracker.exhausted && visited.len() == tracker.iterated_keys.len();
                    if reached_stop || visited.len() > tracker.iterated_keys.len() {
                        break;
                    }
                }
            }
        }

        let holds = !hit_estimate
            && visited == tracker.iterated_keys
            && (exhausted || !tracker.exhausted);
        Ok(if holds {
            None
        } else {
            Some(iter.into_touched_writers())
        })
    }

    /// Replay every recorded scan of `txn_idx`.
    pub fn validate_iterate_set(
        &self,
        txn_idx: TxnIndex,
    ) -> Result<ValidationResult, BaseStoreError> {
        let record = self.record(txn_idx).read();
        let mut valid = true;
        let mut conflicts = BTreeSet::new();
        for tracker in &record.iterate_set {
            if let Some(touched) = self.replay_iteration(txn_idx, tracker)? {
                valid = false;
                conflicts.extend(touched);
            }
        }
        Ok(if valid {
            ValidationResult::Valid
        } else {
            ValidationResult::invalid(conflicts)
        })
    }

    /// Validate both the read set and the recorded scans of `txn_idx`.
    pub fn validate_transaction_state(
        &self,
        txn_idx: TxnIndex,
    ) -> Result<ValidationResult, BaseStoreError> {
        let reads = self.validate_read_set(txn_idx)?;
        let iterations = self.validate_iterate_set(txn_idx)?;
        if reads.is_valid() && iterations.is_valid() {
            return Ok(ValidationResult::Valid);
        }
        let conflicts = reads
            .conflicts()
            .iter()
            .chain(iterations.conflicts())
            .copied()
            .filter(|conflict| *conflict < txn_idx)
            .collect();
        Ok(ValidationResult::invalid(conflicts))
    }

    /// Stage every transaction's installed writes in increasing index order, so
    /// later transactions shadow earlier ones on equal keys.
    pub fn commit_batch(&self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for txn_idx in 0..self.num_txns() as TxnIndex {
            for (key, value) in self.write_set(txn_idx) {
                match value {
                    Some(value) => batch.put(key, value),
                    None => batch.delete(key),
                }
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_stm::base_store::MemoryStore;
    use bytes::Bytes;
    use std::thread;

    fn make_key(slot: u64) -> Key {
        Bytes::from(format!("slot/{slot:04}"))
    }

    fn make_value(val: u64) -> Bytes {
        Bytes::from(val.to_string())
    }

    fn write_set(entries: &[(u64, Option<u64>)]) -> WriteSet {
        entries
            .iter()
            .map(|(slot, val)| (make_key(*slot), val.map(make_value)))
            .collect()
    }

    fn read_set(entries: &[(u64, Option<u64>)]) -> ReadSet {
        entries
            .iter()
            .map(|(slot, val)| (make_key(*slot), vec![val.map(make_value)]))
            .collect()
    }

    fn store(num_txns: usize) -> MultiVersionStore<MemoryStore> {
        MultiVersionStore::new(Arc::new(MemoryStore::new()), num_txns)
    }

    fn tracker(
        start: Option<u64>,
        end: Option<u64>,
        keys: &[u64],
        exhausted: bool,
    ) -> IterationTracker {
        let mut tracker =
            IterationTracker::new(start.map(make_key), end.map(make_key), true, WriteSet::new());
        for slot in keys {
            tracker.visit(make_key(*slot));
        }
        tracker.finish(exhausted);
        tracker
    }

    #[test]
    fn test_basic_write_and_read() {
        let mv = store(3);
        let key = make_key(0);
        mv.set_writeset(0, 0, &write_set(&[(0, Some(100))]));

        // Transaction 1 should see tx 0's write
        match mv.get(&key, 1).unwrap() {
            ReadResult::Value { value, version } => {
                assert_eq!(value, Some(make_value(100)));
                assert_eq!(version, Version::new(0, 0));
            }
            other => panic!("Expected Value result, got {other:?}"),
        }

        // Transaction 0 should not see its own write
        assert_eq!(mv.get(&key, 0).unwrap(), ReadResult::Base { value: None });
    }

    #[test]
    fn test_read_falls_back_to_base() {
        let base = Arc::new(MemoryStore::with_entries([(make_key(7), make_value(70))]));
        let mv = MultiVersionStore::new(base, 2);
        assert_eq!(
            mv.get(&make_key(7), 1).unwrap(),
            ReadResult::Base {
                value: Some(make_value(70))
            }
        );
        assert_eq!(mv.read(&make_key(7), 1), None);
    }

    #[test]
    fn test_read_highest_lower_version() {
        let mv = store(5);
        let key = make_key(0);
        mv.set_writeset(0, 0, &write_set(&[(0, Some(100))]));
        mv.set_writeset(2, 0, &write_set(&[(0, Some(200))]));

        // Tx 4 should see tx 2's write (highest < 4)
        let read = mv.get(&key, 4).unwrap();
        assert_eq!(read.value(), Some(&make_value(200)));
        assert_eq!(read.writer(), Some(2));

        // Tx 1 should see tx 0's write
        let read = mv.get(&key, 1).unwrap();
        assert_eq!(read.value(), Some(&make_value(100)));
        assert_eq!(read.writer(), Some(0));
    }

    #[test]
    fn test_new_incarnation_replaces_previous_keys() {
        let mv = store(2);
        assert!(mv.set_writeset(0, 0, &write_set(&[(0, Some(1)), (1, Some(1))])));
        assert!(!mv.set_writeset(0, 1, &write_set(&[(0, Some(2))])));

        assert_eq!(mv.get(&make_key(1), 1).unwrap(), ReadResult::Base { value: None });
        assert_eq!(mv.written_keys(0), vec![make_key(0)]);
        assert_eq!(mv.get(&make_key(0), 1).unwrap().value(), Some(&make_value(2)));
    }

    #[test]
    fn test_convert_to_estimate() {
        let mv = store(3);
        mv.set_writeset(0, 0, &write_set(&[(0, Some(100))]));

        // Convert tx 0's writes to estimates (simulating a failed validation)
        mv.convert_writes_to_estimates(0);

        let read = mv.get(&make_key(0), 1).unwrap();
        assert!(read.is_estimate());
        assert_eq!(read.writer(), Some(0));
        // Estimates still carry the provisional value
        assert_eq!(read.value(), Some(&make_value(100)));
        // Estimates are never committed
        assert!(mv.write_set(0).is_empty());
    }

    #[test]
    fn test_estimated_writeset_keeps_previous_keys() {
        let mv = store(2);
        mv.set_writeset(0, 0, &write_set(&[(0, Some(1))]));
        mv.set_estimated_writeset(0, 1, &write_set(&[(5, Some(5))]));

        assert!(mv.get(&make_key(0), 1).unwrap().is_estimate());
        assert!(mv.get(&make_key(5), 1).unwrap().is_estimate());
        assert_eq!(mv.written_keys(0), vec![make_key(0), make_key(5)]);
    }

    #[test]
    fn test_invalidate_discards_entries() {
        let mv = store(2);
        mv.record_incarnation(
            Version::new(0, 0),
            read_set(&[(3, None)]),
            &write_set(&[(0, Some(1))]),
            Vec::new(),
        );
        mv.invalidate(0);
        assert_eq!(mv.get(&make_key(0), 1).unwrap(), ReadResult::Base { value: None });
        assert!(mv.read_set(0).is_empty());
        assert!(mv.written_keys(0).is_empty());
    }

    #[test]
    fn test_validation_detects_changed_value() {
        let mv = store(3);

        // Tx 0 writes, tx 1 reads tx 0's write
        mv.set_writeset(0, 0, &write_set(&[(0, Some(100))]));
        mv.record_incarnation(
            Version::new(1, 0),
            read_set(&[(0, Some(100))]),
            &WriteSet::new(),
            Vec::new(),
        );
        assert_eq!(mv.validate_transaction_state(1).unwrap(), ValidationResult::Valid);

        // Now tx 0 re-executes with incarnation 1 and writes a different value
        mv.set_writeset(0, 1, &write_set(&[(0, Some(200))]));
        assert_eq!(
            mv.validate_transaction_state(1).unwrap(),
            ValidationResult::Invalid {
                conflicts: vec![0]
            }
        );
    }

    #[test]
    fn test_same_value_new_incarnation_stays_valid() {
        let mv = store(2);
        mv.set_writeset(0, 0, &write_set(&[(0, Some(100))]));
        mv.record_incarnation(
            Version::new(1, 0),
            read_set(&[(0, Some(100))]),
            &WriteSet::new(),
            Vec::new(),
        );
        // Re-execution writing the same value does not invalidate readers
        mv.set_writeset(0, 1, &write_set(&[(0, Some(100))]));
        assert!(mv.validate_transaction_state(1).unwrap().is_valid());
    }

    #[test]
    fn test_validation_detects_late_lower_write() {
        let mv = store(3);
        // Tx 2 read the key from base state
        mv.record_incarnation(
            Version::new(2, 0),
            read_set(&[(0, None)]),
            &WriteSet::new(),
            Vec::new(),
        );
        assert!(mv.validate_transaction_state(2).unwrap().is_valid());

        // Tx 1 writes the key afterwards
        mv.set_writeset(1, 0, &write_set(&[(0, Some(1))]));
        assert_eq!(
            mv.validate_transaction_state(2).unwrap().conflicts(),
            &[1]
        );
    }

    #[test]
    fn test_validation_detects_estimate_dependency() {
        let mv = store(3);
        mv.set_writeset(0, 0, &write_set(&[(0, Some(100))]));
        mv.record_incarnation(
            Version::new(1, 0),
            read_set(&[(0, Some(100))]),
            &WriteSet::new(),
            Vec::new(),
        );

        mv.convert_writes_to_estimates(0);

        assert_eq!(
            mv.validate_transaction_state(1).unwrap(),
            ValidationResult::Invalid {
                conflicts: vec![0]
            }
        );
    }

    #[test]
    fn test_higher_writes_never_invalidate() {
        let mv = store(3);
        mv.record_incarnation(
            Version::new(1, 0),
            read_set(&[(0, None)]),
            &WriteSet::new(),
            vec![tracker(None, None, &[], true)],
        );
        mv.set_writeset(2, 0, &write_set(&[(0, Some(9))]));
        assert!(mv.validate_transaction_state(1).unwrap().is_valid());
    }

    #[test]
    fn test_iteration_replay_detects_phantom() {
        let base = Arc::new(MemoryStore::with_entries([
            (make_key(1), make_value(1)),
            (make_key(3), make_value(3)),
        ]));
        let mv = MultiVersionStore::new(base, 3);

        // Tx 2 scanned [0, 10) and saw keys 1 and 3
        mv.record_incarnation(
            Version::new(2, 0),
            ReadSet::new(),
            &WriteSet::new(),
            vec![tracker(Some(0), Some(10), &[1, 3], true)],
        );
        assert!(mv.validate_transaction_state(2).unwrap().is_valid());

        // Tx 0 inserts key 2 inside the scanned range
        mv.set_writeset(0, 0, &write_set(&[(2, Some(2))]));
        assert_eq!(
            mv.validate_transaction_state(2).unwrap(),
            ValidationResult::Invalid {
                conflicts: vec![0]
            }
        );
    }

    #[test]
    fn test_iteration_replay_respects_early_stop() {
        let base = Arc::new(MemoryStore::with_entries([
            (make_key(1), make_value(1)),
            (make_key(3), make_value(3)),
        ]));
        let mv = MultiVersionStore::new(base, 3);

        // Tx 2 stopped after the first key
        mv.record_incarnation(
            Version::new(2, 0),
            ReadSet::new(),
            &WriteSet::new(),
            vec![tracker(None, None, &[1], false)],
        );

        // A write past the stopping point is not observed
        mv.set_writeset(1, 0, &write_set(&[(5, Some(5))]));
        assert!(mv.validate_transaction_state(2).unwrap().is_valid());

        // Deleting the key the scan stopped on is
        mv.set_writeset(0, 0, &write_set(&[(1, None)]));
        assert_eq!(mv.validate_transaction_state(2).unwrap().conflicts(), &[0]);
    }

    #[test]
    fn test_iteration_replay_uses_own_writes_snapshot() {
        let mv = store(2);
        let mut tracker = IterationTracker::new(None, None, true, write_set(&[(4, Some(4))]));
        tracker.visit(make_key(4));
        tracker.finish(true);

        mv.record_incarnation(Version::new(1, 0), ReadSet::new(), &WriteSet::new(), vec![tracker]);
        assert!(mv.validate_transaction_state(1).unwrap().is_valid());
    }

    #[test]
    fn test_validation_is_deterministic() {
        let mv = store(4);
        mv.set_writeset(0, 0, &write_set(&[(0, Some(1)), (1, Some(1))]));
        mv.set_writeset(1, 0, &write_set(&[(2, Some(1))]));
        mv.record_incarnation(
            Version::new(3, 0),
            read_set(&[(0, None), (2, None)]),
            &WriteSet::new(),
            vec![tracker(None, None, &[], true)],
        );

        let first = mv.validate_transaction_state(3).unwrap();
        let second = mv.validate_transaction_state(3).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.conflicts(), &[0, 1]);
    }

    #[test]
    fn test_commit_batch_later_writer_wins() {
        let mv = store(8);
        mv.set_writeset(2, 0, &write_set(&[(0, Some(2)), (1, Some(2))]));
        mv.set_writeset(7, 0, &write_set(&[(0, Some(7)), (1, None)]));

        let batch = mv.commit_batch();
        assert_eq!(batch.get(&make_key(0)), Some(&Some(make_value(7))));
        assert_eq!(batch.get(&make_key(1)), Some(&None));
    }

    #[test]
    fn test_reset_starts_new_generation() {
        let mut mv = store(2);
        mv.set_writeset(0, 0, &write_set(&[(0, Some(1))]));
        mv.reset(4);
        assert_eq!(mv.generation(), 1);
        assert_eq!(mv.num_txns(), 4);
        assert_eq!(mv.get(&make_key(0), 3).unwrap(), ReadResult::Base { value: None });
    }

    // ==================== STRESS TESTS ====================

    #[test]
    fn stress_test_non_conflicting_writes() {
        // Many transactions each writing to disjoint keys
        let num_txns = 100;
        let mv = Arc::new(store(num_txns));

        let handles: Vec<_> = (0..num_txns)
            .map(|i| {
                let mv = Arc::clone(&mv);
                thread::spawn(move || {
                    mv.record_incarnation(
                        Version::new(i as u32, 0),
                        ReadSet::new(),
                        &write_set(&[(i as u64, Some(i as u64))]),
                        Vec::new(),
                    );
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        for i in 0..num_txns {
            assert!(
                mv.validate_transaction_state(i as u32).unwrap().is_valid(),
                "Validation failed for tx {i}"
            );
        }
        assert_eq!(mv.commit_batch().len(), num_txns);
    }

    #[test]
    fn stress_test_all_conflicting_writes() {
        // Many transactions all writing to the SAME key
        let num_txns = 50;
        let mv = Arc::new(store(num_txns));

        let handles: Vec<_> = (0..num_txns)
            .map(|i| {
                let mv = Arc::clone(&mv);
                thread::spawn(move || {
                    mv.set_writeset(i as u32, 0, &write_set(&[(0, Some(i as u64))]));
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        // Every reader sees exactly its predecessor
        for i in 1..num_txns {
            let read = mv.get(&make_key(0), i as u32).unwrap();
            assert_eq!(read.writer(), Some(i as u32 - 1));
        }
        assert_eq!(
            mv.commit_batch().get(&make_key(0)),
            Some(&Some(make_value(num_txns as u64 - 1)))
        );
    }

    #[test]
    fn stress_test_concurrent_reads_and_writes() {
        use rand::prelude::*;

        let num_txns = 50;
        let num_keys = 10;
        let mv = Arc::new(store(num_txns));

        thread::scope(|s| {
            for i in 0..num_txns {
                let mv = Arc::clone(&mv);
                s.spawn(move || {
                    let mut rng = rand::rng();
                    for _ in 0..20 {
                        let slot = rng.random_range(0..num_keys);
                        let read = mv.get(&make_key(slot), i as u32).unwrap();
                        if let Some(writer) = read.writer() {
                            assert!(writer < i as u32, "tx {i} observed higher writer {writer}");
                        }
                        let overlay = mv.collect_overlay(i as u32, None, None);
                        assert!(overlay.values().all(|entry| entry.writer < Some(i as u32)));
                    }
                    mv.set_writeset(i as u32, 0, &write_set(&[(i as u64 % num_keys, Some(1))]));
                });
            }
        });
    }
}
