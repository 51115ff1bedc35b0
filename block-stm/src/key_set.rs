//! Ordered index of the keys of one store that have a version tree.

use crate::types::{Direction, Key, KeyRange};
use crate::version_tree::VersionTree;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A key's tree and the sequence number it was published with.
#[derive(Debug)]
struct Slot {
    seq: u64,
    tree: Arc<VersionTree>,
}

/// Immutable view of the key set: the keys published up to `watermark`.
///
/// Keys are never removed, so the view stays fixed while writers keep adding
/// keys behind it.
#[derive(Debug, Clone)]
pub struct KeySnapshot {
    entries: Arc<SkipMap<Key, Slot>>,
    watermark: u64,
}

impl KeySnapshot {
    /// Sequence number of the last key visible in this view.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// The first visible key inside `range` that comes strictly after `after`
    /// in `direction`, or the first one at all when `after` is `None`.
    pub fn next(
        &self,
        range: &KeyRange,
        direction: Direction,
        after: Option<&[u8]>,
    ) -> Option<(Key, Arc<VersionTree>)> {
        let mut lower: Bound<&[u8]> = range.start.as_deref().map_or(Bound::Unbounded, Bound::Included);
        let mut upper: Bound<&[u8]> = range.end.as_deref().map_or(Bound::Unbounded, Bound::Excluded);
        if let Some(after) = after {
            match direction {
                Direction::Ascending => lower = Bound::Excluded(after),
                Direction::Descending => upper = Bound::Excluded(after),
            }
        }
        if is_empty_range(lower, upper) {
            return None;
        }

        let mut candidates = self.entries.range::<[u8], _>((lower, upper));
        loop {
            let entry = match direction {
                Direction::Ascending => candidates.next(),
                Direction::Descending => candidates.next_back(),
            }?;
            let slot = entry.value();
            if slot.seq <= self.watermark {
                return Some((entry.key().clone(), slot.tree.clone()));
            }
        }
    }

    /// Visible keys inside `range`, ascending.
    pub fn keys(&self, range: &KeyRange) -> Vec<Key> {
        let mut keys = Vec::new();
        let mut after: Option<Key> = None;
        while let Some((key, _)) = self.next(range, Direction::Ascending, after.as_deref()) {
            keys.push(key.clone());
            after = Some(key);
        }
        keys
    }
}

fn is_empty_range(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
        (Bound::Included(lo) | Bound::Excluded(lo), Bound::Excluded(hi))
        | (Bound::Excluded(lo), Bound::Included(hi)) => lo >= hi,
        _ => false,
    }
}

/// Set of keys with at least one tentative write, ordered by key.
///
/// Writers add keys to a concurrent skip list under a lock only writers take,
/// then advance the watermark. Readers load the watermark and walk the skip
/// list without locking, ignoring keys published after it.
#[derive(Debug, Default)]
pub struct OrderedKeySet {
    entries: Arc<SkipMap<Key, Slot>>,
    /// Next sequence number to hand out.
    writer: Mutex<u64>,
    watermark: AtomicU64,
}

impl OrderedKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `key` with `tree` and returns the tree now bound to `key`:
    /// `tree` itself, or the one published first if the key already exists.
    pub fn insert(&self, key: Key, tree: Arc<VersionTree>) -> Arc<VersionTree> {
        if let Some(entry) = self.entries.get(&key) {
            return entry.value().tree.clone();
        }

        let mut next_seq = self.writer.lock();
        if let Some(entry) = self.entries.get(&key) {
            return entry.value().tree.clone();
        }
        *next_seq += 1;
        let seq = *next_seq;
        self.entries.insert(key, Slot { seq, tree: tree.clone() });
        self.watermark.store(seq, Ordering::Release);
        tree
    }

    /// View of every key published so far.
    pub fn snapshot(&self) -> KeySnapshot {
        KeySnapshot {
            entries: self.entries.clone(),
            watermark: self.watermark.load(Ordering::Acquire),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
