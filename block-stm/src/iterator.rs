//! Range iteration over the multi-version overlay merged with base storage.
//!
//! The same cursor serves execution (through [`crate::view::StoreIterator`])
//! and validation replay, so both observe the identical key sequence for a
//! given transaction index.

use crate::key_set::KeySnapshot;
use crate::storage::BaseIter;
use crate::types::{Direction, Key, KeyRange, TxnIndex, Value, Version};
use crate::version_tree::{Seek, VersionTree, VersionedEntry};
use std::cmp::Ordering;
use std::iter::Peekable;
use std::sync::Arc;

/// One step of a merged iteration.
#[derive(Debug)]
pub(crate) enum Step {
    /// The next visible key. `version` is `None` for pre-block values.
    Item {
        key: Key,
        value: Value,
        version: Option<Version>,
    },
    /// The next key in the overlay is an estimate of `blocking`; the cursor
    /// stays in place until the caller has waited and steps again.
    Estimate(TxnIndex),
    Done,
}

#[derive(Debug)]
enum Resolved {
    Written { value: Value, version: Version },
    Deleted,
    Estimate(TxnIndex),
}

struct OverlayHead {
    key: Key,
    tree: Arc<VersionTree>,
    resolved: Resolved,
}

/// Merges the overlay key snapshot, resolved at `txn`, with base storage.
pub(crate) struct MergeCursor<'s> {
    txn: TxnIndex,
    direction: Direction,
    range: KeyRange,
    snapshot: KeySnapshot,
    /// Last overlay key taken from the snapshot.
    last: Option<Key>,
    head: Option<OverlayHead>,
    base: Peekable<BaseIter<'s>>,
}

impl<'s> MergeCursor<'s> {
    pub(crate) fn new(
        txn: TxnIndex,
        snapshot: KeySnapshot,
        range: &KeyRange,
        direction: Direction,
        base: BaseIter<'s>,
    ) -> Self {
        Self {
            txn,
            direction,
            range: range.clone(),
            snapshot,
            last: None,
            head: None,
            base: base.peekable(),
        }
    }

    pub(crate) fn next_step(&mut self) -> Step {
        loop {
            let Some(head) = self.take_head() else {
                return match self.base.next() {
                    Some((key, value)) => Step::Item { key, value, version: None },
                    None => Step::Done,
                };
            };

            let direction = self.direction;
            let ordering = match self.base.peek() {
                Some((base_key, _)) => direction.order(&head.key, base_key),
                None => Ordering::Less,
            };

            if ordering == Ordering::Greater {
                self.head = Some(head);
                if let Some((key, value)) = self.base.next() {
                    return Step::Item { key, value, version: None };
                }
                continue;
            }

            if let Resolved::Estimate(blocking) = head.resolved {
                self.head = Some(head);
                return Step::Estimate(blocking);
            }

            if ordering == Ordering::Equal {
                // The overlay shadows the base entry at the same key.
                self.base.next();
            }

            match head.resolved {
                Resolved::Written { value, version } => {
                    return Step::Item {
                        key: head.key,
                        value,
                        version: Some(version),
                    };
                }
                Resolved::Deleted | Resolved::Estimate(_) => continue,
            }
        }
    }

    /// Next overlay key that has a writer before `txn`. A pending estimate is
    /// resolved again, since its writer may have finished in the meantime.
    fn take_head(&mut self) -> Option<OverlayHead> {
        if let Some(head) = self.head.take() {
            if !matches!(head.resolved, Resolved::Estimate(_)) {
                return Some(head);
            }
            if let Some(head) = self.resolve(head.key, head.tree) {
                return Some(head);
            }
        }

        loop {
            let (key, tree) = self.snapshot.next(&self.range, self.direction, self.last.as_deref())?;
            self.last = Some(key.clone());
            if let Some(head) = self.resolve(key, tree) {
                return Some(head);
            }
        }
    }

    fn resolve(&self, key: Key, tree: Arc<VersionTree>) -> Option<OverlayHead> {
        let (writer, entry) = match tree.reverse_seek(self.txn)? {
            Seek::PreState(_) => return None,
            Seek::Entry { txn, entry } => (txn, entry),
        };

        let resolved = match entry {
            VersionedEntry::Written { value, incarnation, .. } => Resolved::Written {
                value,
                version: Version::new(writer, incarnation),
            },
            VersionedEntry::Deleted { .. } => Resolved::Deleted,
            VersionedEntry::Estimate { .. } => Resolved::Estimate(writer),
        };
        Some(OverlayHead { key, tree, resolved })
    }
}
