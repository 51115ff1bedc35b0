//! Per-key version history.
//!
//! Writers occupy slot `T + 1` so that the largest slot `<= T` is the last
//! writer strictly before `T`; slot 0 holds the cached pre-block value. Most
//! keys have zero or one writer per block, so slots start out in an inline
//! vector and move to a `BTreeMap` when a second writer shows up.

use crate::types::{Incarnation, TxnIndex, Value};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;

const PRE_STATE_SLOT: usize = 0;
const INLINE_SLOTS: usize = 2;

/// Entry written by one transaction.
#[derive(Debug, Clone)]
pub enum VersionedEntry {
    /// The transaction wrote `value`. `snapshot` holds the value bytes when
    /// they are small enough to be compared during validation.
    Written {
        value: Value,
        incarnation: Incarnation,
        snapshot: Option<Arc<[u8]>>,
    },
    /// The transaction deleted the key.
    Deleted { incarnation: Incarnation },
    /// The transaction is expected to write here again; readers must wait.
    Estimate { incarnation: Incarnation },
}

impl VersionedEntry {
    pub fn incarnation(&self) -> Incarnation {
        match self {
            VersionedEntry::Written { incarnation, .. }
            | VersionedEntry::Deleted { incarnation }
            | VersionedEntry::Estimate { incarnation } => *incarnation,
        }
    }

    pub fn is_estimate(&self) -> bool {
        matches!(self, VersionedEntry::Estimate { .. })
    }
}

/// Result of [`VersionTree::reverse_seek`].
#[derive(Debug, Clone)]
pub enum Seek {
    /// Entry of the last writer before the seek index.
    Entry { txn: TxnIndex, entry: VersionedEntry },
    /// No writer before the seek index; the cached pre-block value.
    PreState(Option<Value>),
}

#[derive(Debug, Clone)]
enum Slot {
    PreState(Option<Value>),
    Entry(VersionedEntry),
}

#[derive(Debug)]
enum Slots {
    Inline(SmallVec<[(usize, Slot); INLINE_SLOTS]>),
    Tree(BTreeMap<usize, Slot>),
}

impl Slots {
    fn get_mut(&mut self, slot: usize) -> Option<&mut Slot> {
        match self {
            Slots::Inline(items) => items
                .iter_mut()
                .find(|(s, _)| *s == slot)
                .map(|(_, value)| value),
            Slots::Tree(map) => map.get_mut(&slot),
        }
    }

    fn contains(&self, slot: usize) -> bool {
        match self {
            Slots::Inline(items) => items.iter().any(|(s, _)| *s == slot),
            Slots::Tree(map) => map.contains_key(&slot),
        }
    }

    fn insert(&mut self, slot: usize, value: Slot) {
        if let Slots::Inline(items) = self {
            match items.binary_search_by_key(&slot, |(s, _)| *s) {
                Ok(pos) => {
                    items[pos].1 = value;
                    return;
                }
                Err(pos) => {
                    let has_writer = items.iter().any(|(s, _)| *s != PRE_STATE_SLOT);
                    if slot == PRE_STATE_SLOT || !has_writer {
                        items.insert(pos, (slot, value));
                        return;
                    }
                }
            }
            let promoted = items.drain(..).collect();
            *self = Slots::Tree(promoted);
        }
        if let Slots::Tree(map) = self {
            map.insert(slot, value);
        }
    }

    fn remove(&mut self, slot: usize) -> Option<Slot> {
        match self {
            Slots::Inline(items) => {
                let pos = items.iter().position(|(s, _)| *s == slot)?;
                Some(items.remove(pos).1)
            }
            Slots::Tree(map) => map.remove(&slot),
        }
    }

    /// Largest slot `<= slot`.
    fn floor(&self, slot: usize) -> Option<(usize, &Slot)> {
        match self {
            Slots::Inline(items) => items
                .iter()
                .rev()
                .find(|(s, _)| *s <= slot)
                .map(|(s, value)| (*s, value)),
            Slots::Tree(map) => map.range(..=slot).next_back().map(|(s, value)| (*s, value)),
        }
    }

    fn last(&self) -> Option<(usize, &Slot)> {
        match self {
            Slots::Inline(items) => items.last().map(|(s, value)| (*s, value)),
            Slots::Tree(map) => map.iter().next_back().map(|(s, value)| (*s, value)),
        }
    }

    fn first(&self) -> Option<(usize, &Slot)> {
        match self {
            Slots::Inline(items) => items.first().map(|(s, value)| (*s, value)),
            Slots::Tree(map) => map.iter().next().map(|(s, value)| (*s, value)),
        }
    }
}

/// Ordered map `TxnIndex -> VersionedEntry` for a single key.
#[derive(Debug)]
pub struct VersionTree {
    slots: RwLock<Slots>,
}

impl VersionTree {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots::Inline(SmallVec::new())),
        }
    }

    pub fn put_written(
        &self,
        txn: TxnIndex,
        incarnation: Incarnation,
        value: Value,
        snapshot: Option<Arc<[u8]>>,
    ) {
        let entry = VersionedEntry::Written { value, incarnation, snapshot };
        self.slots.write().insert(txn + 1, Slot::Entry(entry));
    }

    pub fn put_deleted(&self, txn: TxnIndex, incarnation: Incarnation) {
        let entry = VersionedEntry::Deleted { incarnation };
        self.slots.write().insert(txn + 1, Slot::Entry(entry));
    }

    /// Inserts an estimate for `txn`, replacing any entry it had.
    pub fn put_estimate(&self, txn: TxnIndex, incarnation: Incarnation) {
        let entry = VersionedEntry::Estimate { incarnation };
        self.slots.write().insert(txn + 1, Slot::Entry(entry));
    }

    /// Turns the entry of `txn` into an estimate, keeping its incarnation.
    /// Returns `false` if `txn` has no entry.
    pub fn mark_estimate(&self, txn: TxnIndex) -> bool {
        let mut slots = self.slots.write();
        match slots.get_mut(txn + 1) {
            Some(Slot::Entry(entry)) => {
                let incarnation = entry.incarnation();
                *entry = VersionedEntry::Estimate { incarnation };
                true
            }
            _ => false,
        }
    }

    /// Removes the entry of `txn` if it is an estimate.
    pub fn clear_estimate(&self, txn: TxnIndex) -> bool {
        let mut slots = self.slots.write();
        let is_estimate = matches!(
            slots.get_mut(txn + 1),
            Some(Slot::Entry(VersionedEntry::Estimate { .. }))
        );
        if is_estimate {
            slots.remove(txn + 1);
        }
        is_estimate
    }

    /// Removes whatever `txn` wrote.
    pub fn remove(&self, txn: TxnIndex) {
        self.slots.write().remove(txn + 1);
    }

    /// Finds the last writer strictly before `txn`, falling back to the cached
    /// pre-block value. `None` means neither exists.
    pub fn reverse_seek(&self, txn: TxnIndex) -> Option<Seek> {
        let slots = self.slots.read();
        match slots.floor(txn)? {
            (_, Slot::PreState(value)) => Some(Seek::PreState(value.clone())),
            (slot, Slot::Entry(entry)) => Some(Seek::Entry {
                txn: slot - 1,
                entry: entry.clone(),
            }),
        }
    }

    /// Entry of the highest writer in the block.
    pub fn max(&self) -> Option<(TxnIndex, VersionedEntry)> {
        let slots = self.slots.read();
        match slots.last()? {
            (slot, Slot::Entry(entry)) => Some((slot - 1, entry.clone())),
            (_, Slot::PreState(_)) => None,
        }
    }

    /// Records the pre-block value of the key so later readers skip storage.
    pub fn cache_pre_state(&self, value: Option<Value>) {
        let mut slots = self.slots.write();
        if !slots.contains(PRE_STATE_SLOT) {
            slots.insert(PRE_STATE_SLOT, Slot::PreState(value));
        }
    }

    pub fn pre_state(&self) -> Option<Option<Value>> {
        match self.slots.read().first()? {
            (PRE_STATE_SLOT, Slot::PreState(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Whether `txn` currently has an entry.
    pub fn has_entry(&self, txn: TxnIndex) -> bool {
        self.slots.read().contains(txn + 1)
    }

    #[cfg(test)]
    fn is_promoted(&self) -> bool {
        matches!(*self.slots.read(), Slots::Tree(_))
    }
}

impl Default for VersionTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(b: &[u8]) -> Value {
        Value::bytes(b)
    }

    fn written_txn(seek: Option<Seek>) -> Option<TxnIndex> {
        match seek {
            Some(Seek::Entry { txn, .. }) => Some(txn),
            _ => None,
        }
    }

    #[test]
    fn test_reverse_seek_is_strictly_less() {
        let tree = VersionTree::new();
        tree.put_written(3, 0, bytes(b"a"), None);

        assert!(tree.reverse_seek(3).is_none());
        assert_eq!(written_txn(tree.reverse_seek(4)), Some(3));
        assert_eq!(written_txn(tree.reverse_seek(100)), Some(3));

        tree.cache_pre_state(Some(bytes(b"base")));
        match tree.reverse_seek(2) {
            Some(Seek::PreState(Some(value))) => assert_eq!(value, bytes(b"base")),
            other => panic!("expected pre-state, got {other:?}"),
        }
        assert_eq!(written_txn(tree.reverse_seek(0)), None);
    }

    #[test]
    fn test_promotion_on_second_writer() {
        let tree = VersionTree::new();
        tree.cache_pre_state(None);
        tree.put_written(5, 0, bytes(b"x"), None);
        assert!(!tree.is_promoted());

        tree.put_written(5, 1, bytes(b"y"), None);
        assert!(!tree.is_promoted());

        tree.put_deleted(2, 0);
        assert!(tree.is_promoted());

        assert_eq!(written_txn(tree.reverse_seek(5)), Some(2));
        assert_eq!(written_txn(tree.reverse_seek(6)), Some(5));
        let (txn, entry) = tree.max().unwrap();
        assert_eq!(txn, 5);
        assert_eq!(entry.incarnation(), 1);
    }

    #[test]
    fn test_estimates() {
        let tree = VersionTree::new();
        tree.put_written(1, 2, bytes(b"v"), None);
        assert!(tree.mark_estimate(1));
        assert!(!tree.mark_estimate(7));

        match tree.reverse_seek(4) {
            Some(Seek::Entry { txn: 1, entry }) => {
                assert!(entry.is_estimate());
                assert_eq!(entry.incarnation(), 2);
            }
            other => panic!("expected estimate, got {other:?}"),
        }

        assert!(tree.clear_estimate(1));
        assert!(!tree.has_entry(1));
        assert!(tree.max().is_none());
    }

    #[test]
    fn test_pre_state_is_not_a_writer() {
        let tree = VersionTree::new();
        tree.cache_pre_state(Some(bytes(b"p")));
        tree.cache_pre_state(None);
        assert!(tree.max().is_none());
        assert_eq!(tree.pre_state(), Some(Some(bytes(b"p"))));
    }
}
