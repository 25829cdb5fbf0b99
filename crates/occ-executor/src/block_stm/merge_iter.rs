//! Merge iterator over the base store and the speculative overlay.
//!
//! Execution-time scans and validation-time replays both go through
//! [`MergeIterator`], so the same inputs must always produce the same key
//! sequence. The overlay is an ordered map and the base scan is ordered by the
//! backend; nothing here depends on hash iteration order.

use crate::block_stm::{
    base_store::KvIter,
    types::{AbortSignal, Key, TxnIndex, Value, WriteSet},
};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    iter::Peekable,
};

/// A speculative entry visible to one reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEntry {
    /// `None` marks a deletion.
    pub value: Option<Value>,
    /// Writing transaction, `None` for the reader's own buffered write.
    pub writer: Option<TxnIndex>,
    pub estimate: bool,
}

impl OverlayEntry {
    pub fn local(value: Option<Value>) -> Self {
        Self {
            value,
            writer: None,
            estimate: false,
        }
    }
}

/// Overlay entries keyed in ascending order.
pub type Overlay = BTreeMap<Key, OverlayEntry>;

type OverlayIter = Box<dyn Iterator<Item = (Key, OverlayEntry)> + Send>;

/// Layer the reader's own writes within `[start, end)` on top of `overlay`.
pub(crate) fn layer_write_set(
    overlay: &mut Overlay,
    write_set: &WriteSet,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
) {
    for (key, value) in write_set {
        let after_start = start.map_or(true, |start| key.as_ref() >= start);
        let before_end = end.map_or(true, |end| key.as_ref() < end);
        if after_start && before_end {
            overlay.insert(key.clone(), OverlayEntry::local(value.clone()));
        }
    }
}

enum Step {
    Done,
    Base,
    Overlay,
    Shadowed,
}

/// Orders two keys by iteration direction: `Less` means `a` is visited first.
fn directed_cmp(a: &[u8], b: &[u8], ascending: bool) -> Ordering {
    if ascending {
        a.cmp(b)
    } else {
        b.cmp(a)
    }
}

/// Produces one ordered key sequence from a base scan and an overlay.
///
/// - Overlay entries shadow base entries with the same key.
/// - Overlay deletions are skipped.
/// - Reaching an estimate entry yields the writer as an [`AbortSignal`] and
///   fuses the iterator.
pub struct MergeIterator<'a> {
    base: Peekable<KvIter<'a>>,
    overlay: Peekable<OverlayIter>,
    ascending: bool,
    touched: BTreeSet<TxnIndex>,
    done: bool,
}

impl<'a> MergeIterator<'a> {
    /// `base` must already be ordered in the requested direction and `overlay`
    /// restricted to the scanned range.
    pub fn new(base: KvIter<'a>, overlay: Overlay, ascending: bool) -> Self {
        let overlay: OverlayIter = if ascending {
            Box::new(overlay.into_iter())
        } else {
            Box::new(overlay.into_iter().rev())
        };
        Self {
            base: base.peekable(),
            overlay: overlay.peekable(),
            ascending,
            touched: BTreeSet::new(),
            done: false,
        }
    }

    /// Writers of every overlay entry consumed so far, including skipped deletions.
    pub fn touched_writers(&self) -> &BTreeSet<TxnIndex> {
        &self.touched
    }

    pub fn into_touched_writers(self) -> BTreeSet<TxnIndex> {
        self.touched
    }

    fn next_step(&mut self) -> Step {
        let ascending = self.ascending;
        match (self.base.peek(), self.overlay.peek()) {
            (None, None) => Step::Done,
            (Some(_), None) => Step::Base,
            (None, Some(_)) => Step::Overlay,
            (Some((base_key, _)), Some((overlay_key, _))) => {
                match directed_cmp(base_key, overlay_key, ascending) {
                    Ordering::Less => Step::Base,
                    Ordering::Greater => Step::Overlay,
                    Ordering::Equal => Step::Shadowed,
                }
            }
        }
    }

    /// Consume the next overlay entry. Returns `None` when it was a deletion.
    fn take_overlay(&mut self) -> Option<Result<(Key, Value), AbortSignal>> {
        let (key, entry) = self.overlay.next()?;
        if let Some(writer) = entry.writer {
            self.touched.insert(writer);
            if entry.estimate {
                self.done = true;
                return Some(Err(AbortSignal::new(writer)));
            }
        }
        entry.value.map(|value| Ok((key, value)))
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<(Key, Value), AbortSignal>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.next_step() {
                Step::Done => self.done = true,
                Step::Base => return self.base.next().map(Ok),
                Step::Shadowed => {
                    self.base.next();
                    if let Some(item) = self.take_overlay() {
                        return Some(item);
                    }
                }
                Step::Overlay => {
                    if let Some(item) = self.take_overlay() {
                        return Some(item);
                    }
                }
            }
        }
        None
    }
}
