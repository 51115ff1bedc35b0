//! Multi-version store: the versioned writes of one named store.

use crate::error::{BlockStmError, Result};
use crate::iterator::{MergeCursor, Step};
use crate::key_set::OrderedKeySet;
use crate::read_set::{Captured, IteratorDescriptor, ReadDescriptor, ReadSet};
use crate::storage::{ChangeSet, Storage};
use crate::types::{Direction, Incarnation, Key, KeyRange, StoreId, StoreKind, TxnIndex, Value, Version};
use crate::version_tree::{Seek, VersionTree, VersionedEntry};
use dashmap::DashMap;
use std::sync::Arc;

/// Result of reading from an [`MVStore`].
#[derive(Debug, Clone)]
pub enum MVRead {
    /// Written (`Some`) or deleted (`None`) by an earlier transaction.
    Versioned {
        version: Version,
        value: Option<Value>,
        captured: Option<Captured>,
    },
    /// The last earlier writer is being re-executed.
    Estimate { blocking: TxnIndex },
    /// No earlier writer; read the pre-block state. `cached` holds it when a
    /// previous reader already fetched it.
    Storage { cached: Option<Option<Value>> },
}

/// Versioned writes of a single store, keyed by key then transaction index.
#[derive(Debug)]
pub struct MVStore {
    id: StoreId,
    kind: StoreKind,
    capture_limit: usize,
    trees: DashMap<Key, Arc<VersionTree>>,
    keys: OrderedKeySet,
}

impl MVStore {
    pub fn new(id: StoreId, kind: StoreKind, capture_limit: usize) -> Self {
        Self {
            id,
            kind,
            capture_limit,
            trees: DashMap::new(),
            keys: OrderedKeySet::new(),
        }
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    fn tree(&self, key: &[u8]) -> Option<Arc<VersionTree>> {
        self.trees.get(key).map(|tree| tree.clone())
    }

    fn tree_or_insert(&self, key: &[u8]) -> Arc<VersionTree> {
        if let Some(tree) = self.tree(key) {
            return tree;
        }
        // The key set picks the tree, outside any map shard lock.
        let key = Key::from(key);
        let tree = self.keys.insert(key.clone(), Arc::new(VersionTree::new()));
        self.trees.entry(key).or_insert_with(|| tree.clone()).clone()
    }

    /// Snapshot of a value for value-based validation. Object stores and
    /// large values are never captured.
    pub fn capture(&self, value: Option<&Value>) -> Option<Captured> {
        if self.kind != StoreKind::Bytes {
            return None;
        }
        match value {
            None => Some(Captured::Absent),
            Some(Value::Bytes(bytes)) if bytes.len() <= self.capture_limit => {
                Some(Captured::Bytes(bytes.clone()))
            }
            Some(_) => None,
        }
    }

    /// Reads `key` as transaction `txn` sees it: the last write of a
    /// transaction before `txn`, else the pre-block state.
    pub fn read(&self, key: &[u8], txn: TxnIndex) -> MVRead {
        let Some(tree) = self.tree(key) else {
            return MVRead::Storage { cached: None };
        };
        match tree.reverse_seek(txn) {
            None => MVRead::Storage { cached: None },
            Some(Seek::PreState(value)) => MVRead::Storage { cached: Some(value) },
            Some(Seek::Entry { txn: writer, entry }) => match entry {
                VersionedEntry::Estimate { .. } => MVRead::Estimate { blocking: writer },
                VersionedEntry::Written { value, incarnation, snapshot } => MVRead::Versioned {
                    version: Version::new(writer, incarnation),
                    captured: snapshot.map(Captured::Bytes),
                    value: Some(value),
                },
                VersionedEntry::Deleted { incarnation } => MVRead::Versioned {
                    version: Version::new(writer, incarnation),
                    captured: self.capture(None),
                    value: None,
                },
            },
        }
    }

    /// Caches the pre-block value of `key` if the key already has writers.
    pub fn cache_pre_state(&self, key: &[u8], value: Option<Value>) {
        if let Some(tree) = self.tree(key) {
            tree.cache_pre_state(value);
        }
    }

    pub fn write(&self, key: &[u8], value: Value, version: Version) {
        let snapshot = match self.capture(Some(&value)) {
            Some(Captured::Bytes(bytes)) => Some(bytes),
            _ => None,
        };
        self.tree_or_insert(key)
            .put_written(version.txn_idx, version.incarnation, value, snapshot);
    }

    pub fn delete(&self, key: &[u8], version: Version) {
        self.tree_or_insert(key)
            .put_deleted(version.txn_idx, version.incarnation);
    }

    /// Marks `key` as going to be written by `txn`.
    pub fn put_estimate(&self, key: &[u8], txn: TxnIndex, incarnation: Incarnation) {
        self.tree_or_insert(key).put_estimate(txn, incarnation);
    }

    /// Drops the entry `txn` left at `key` from an earlier incarnation.
    pub fn remove(&self, key: &[u8], txn: TxnIndex) {
        if let Some(tree) = self.tree(key) {
            tree.remove(txn);
        }
    }

    /// Converts the entries `txn` wrote at `keys` into estimates.
    pub fn mark_estimates(&self, txn: TxnIndex, keys: &[Key]) {
        for key in keys {
            if let Some(tree) = self.tree(key) {
                tree.mark_estimate(txn);
            }
        }
    }

    /// Removes the estimates `txn` left at `keys`.
    pub fn clear_estimates(&self, txn: TxnIndex, keys: &[Key]) {
        for key in keys {
            if let Some(tree) = self.tree(key) {
                tree.clear_estimate(txn);
            }
        }
    }

    /// Merge cursor over this store and `storage`, as seen by `txn`.
    pub(crate) fn cursor<'s>(
        &self,
        txn: TxnIndex,
        range: &KeyRange,
        direction: Direction,
        storage: &'s dyn Storage,
    ) -> MergeCursor<'s> {
        let base = storage.range(self.id, range, direction);
        MergeCursor::new(txn, self.keys.snapshot(), range, direction, base)
    }

    /// Checks that every read recorded by `txn` would still observe the same
    /// value now.
    pub fn validate_read_set(&self, txn: TxnIndex, read_set: &ReadSet, storage: &dyn Storage) -> bool {
        read_set
            .reads
            .iter()
            .all(|read| self.validate_read(txn, read, storage))
            && read_set
                .iterators
                .iter()
                .all(|iterator| self.validate_iterator(txn, iterator, storage))
    }

    fn validate_read(&self, txn: TxnIndex, read: &ReadDescriptor, storage: &dyn Storage) -> bool {
        match self.read(&read.key, txn) {
            MVRead::Estimate { .. } => false,
            MVRead::Versioned { version, captured, .. } => {
                if read.version == Some(version) {
                    return true;
                }
                matches!((&read.captured, &captured), (Some(a), Some(b)) if a == b)
            }
            MVRead::Storage { cached } => {
                if read.version.is_none() {
                    return true;
                }
                let Some(expected) = &read.captured else {
                    return false;
                };
                let value = match cached {
                    Some(value) => value,
                    None => storage.get(self.id, &read.key),
                };
                self.capture(value.as_ref()).as_ref() == Some(expected)
            }
        }
    }

    fn validate_iterator(&self, txn: TxnIndex, iterator: &IteratorDescriptor, storage: &dyn Storage) -> bool {
        let mut cursor = self.cursor(txn, &iterator.range, iterator.direction, storage);
        for read in &iterator.reads {
            match cursor.next_step() {
                Step::Item { key, version, .. } if key == read.key && version == read.version => {}
                _ => return false,
            }
        }
        !iterator.exhausted || matches!(cursor.next_step(), Step::Done)
    }

    /// Adds the highest write of every key to `changes`.
    pub fn snapshot_to(&self, changes: &mut ChangeSet) -> Result<()> {
        for item in self.trees.iter() {
            let Some((txn, entry)) = item.value().max() else {
                continue;
            };
            match entry {
                VersionedEntry::Written { value, .. } => changes.set(self.id, item.key().clone(), value),
                VersionedEntry::Deleted { .. } => changes.delete(self.id, item.key().clone()),
                VersionedEntry::Estimate { .. } => {
                    return Err(BlockStmError::SchedulerStuck(format!(
                        "estimate of transaction {txn} left in {} at commit",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of keys with a version tree.
    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }
}
