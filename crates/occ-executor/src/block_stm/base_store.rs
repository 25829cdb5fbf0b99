//! Durable backend boundary.
//!
//! The executor treats the backend as the version "-1" layer beneath the
//! multi-version store: reads fall through to it, and the final commit is a
//! single [`WriteBatch`] applied atomically.

use crate::block_stm::types::{Key, Value};
use parking_lot::RwLock;
use std::{collections::BTreeMap, ops::Bound};

/// Error raised by a durable backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BaseStoreError {
    #[error("base store I/O error: {0}")]
    Io(String),
}

/// Ordered key/value pairs returned by a range scan.
pub type KvIter<'a> = Box<dyn Iterator<Item = (Key, Value)> + Send + 'a>;

/// Staged writes applied by one [`BaseStore::write_batch`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: BTreeMap<Key, Option<Value>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a write, shadowing any earlier op on the same key.
    pub fn put(&mut self, key: Key, value: Value) {
        self.ops.insert(key, Some(value));
    }

    /// Stage a deletion, shadowing any earlier op on the same key.
    pub fn delete(&mut self, key: Key) {
        self.ops.insert(key, None);
    }

    pub fn get(&self, key: &[u8]) -> Option<&Option<Value>> {
        self.ops.get(key)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Ops in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Option<Value>)> {
        self.ops.iter()
    }
}

impl IntoIterator for WriteBatch {
    type Item = (Key, Option<Value>);
    type IntoIter = std::collections::btree_map::IntoIter<Key, Option<Value>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// An ordered byte-key store sitting beneath the speculative layer.
///
/// Range bounds are `[start, end)`; `None` means unbounded on that side.
pub trait BaseStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, BaseStoreError>;

    /// Keys in ascending order.
    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>)
        -> Result<KvIter<'_>, BaseStoreError>;

    /// Keys in descending order.
    fn reverse_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<KvIter<'_>, BaseStoreError>;

    /// Apply every op in `batch` or none of them.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), BaseStoreError>;

    fn set(&self, key: Key, value: Value) -> Result<(), BaseStoreError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write_batch(batch)
    }

    fn delete(&self, key: Key) -> Result<(), BaseStoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write_batch(batch)
    }

    fn has(&self, key: &[u8]) -> Result<bool, BaseStoreError> {
        Ok(self.get(key)?.is_some())
    }
}

/// Converts optional `[start, end)` bounds into a range usable on ordered maps.
pub(crate) fn range_bounds<'a>(
    start: Option<&'a [u8]>,
    end: Option<&'a [u8]>,
) -> (Bound<&'a [u8]>, Bound<&'a [u8]>) {
    (
        start.map_or(Bound::Unbounded, Bound::Included),
        end.map_or(Bound::Unbounded, Bound::Excluded),
    )
}

/// Returns true if `start..end` cannot contain any key.
pub(crate) fn is_empty_range(start: Option<&[u8]>, end: Option<&[u8]>) -> bool {
    matches!((start, end), (Some(start), Some(end)) if start >= end)
}

/// In-memory ordered backend. Scans return a snapshot taken under the read lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Key, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `entries`.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Key>,
        V: Into<Value>,
    {
        let data = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            data: RwLock::new(data),
        }
    }

    /// Copy of the full contents.
    pub fn snapshot(&self) -> BTreeMap<Key, Value> {
        self.data.read().clone()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn scan(&self, start: Option<&[u8]>, end: Option<&[u8]>, ascending: bool) -> Vec<(Key, Value)> {
        if is_empty_range(start, end) {
            return Vec::new();
        }
        let data = self.data.read();
        let range = data
            .range::<[u8], _>(range_bounds(start, end))
            .map(|(k, v)| (k.clone(), v.clone()));
        if ascending {
            range.collect()
        } else {
            range.rev().collect()
        }
    }
}

impl BaseStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, BaseStoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<KvIter<'_>, BaseStoreError> {
        Ok(Box::new(self.scan(start, end, true).into_iter()))
    }

    fn reverse_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<KvIter<'_>, BaseStoreError> {
        Ok(Box::new(self.scan(start, end, false).into_iter()))
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), BaseStoreError> {
        let mut data = self.data.write();
        for (key, op) in batch {
            match op {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
