//! Multi-version memory shared by all workers of a block.

use crate::error::{BlockStmError, Result};
use crate::estimates::PreEstimates;
use crate::mvstore::MVStore;
use crate::read_set::TxnReadSet;
use crate::storage::{ChangeSet, Storage};
use crate::types::{Key, StoreConfig, StoreId, TxnIndex, Value, Version};
use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Buffered writes of one store. `None` marks a deletion.
pub type WriteSet = BTreeMap<Key, Option<Value>>;

/// Multi-version memory: one [`MVStore`] per named store plus the last read
/// set and written locations of every transaction.
pub struct MVMemory<'s> {
    stores: Vec<MVStore>,
    storage: &'s dyn Storage,
    last_read_set: Vec<CachePadded<ArcSwapOption<TxnReadSet>>>,
    /// Keys written by the latest incarnation of each transaction, per store,
    /// sorted.
    last_written: Vec<CachePadded<Mutex<Vec<Vec<Key>>>>>,
}

impl<'s> MVMemory<'s> {
    pub fn new(
        num_txns: usize,
        stores: &[StoreConfig],
        capture_limit: usize,
        storage: &'s dyn Storage,
    ) -> Self {
        Self {
            stores: stores
                .iter()
                .enumerate()
                .map(|(index, config)| MVStore::new(StoreId(index as u16), config.kind, capture_limit))
                .collect(),
            storage,
            last_read_set: (0..num_txns)
                .map(|_| CachePadded::new(ArcSwapOption::empty()))
                .collect(),
            last_written: (0..num_txns)
                .map(|_| CachePadded::new(Mutex::new(vec![Vec::new(); stores.len()])))
                .collect(),
        }
    }

    /// Seeds each hinted location as an estimate of its transaction.
    pub fn seed_estimates(&self, estimates: &PreEstimates) -> Result<()> {
        estimates.validate(self.last_written.len(), self.stores.len())?;

        for (txn, store, key) in estimates.iter() {
            self.stores[store.index()].put_estimate(key, txn, 0);
            self.last_written[txn].lock()[store.index()].push(key.clone());
        }
        for written in &self.last_written {
            for keys in written.lock().iter_mut() {
                keys.sort();
                keys.dedup();
            }
        }
        Ok(())
    }

    pub fn store(&self, id: StoreId) -> Result<&MVStore> {
        self.stores.get(id.index()).ok_or(BlockStmError::UnknownStore(id))
    }

    pub fn num_stores(&self) -> usize {
        self.stores.len()
    }

    pub fn num_txns(&self) -> usize {
        self.last_written.len()
    }

    pub fn storage(&self) -> &'s dyn Storage {
        self.storage
    }

    /// Writes the buffered writes of `version` and drops entries its previous
    /// incarnation wrote but this one did not. Returns whether any key was
    /// written that the previous incarnation had not written.
    pub fn apply_write_sets(&self, version: Version, write_sets: &[WriteSet]) -> bool {
        let txn = version.txn_idx;
        let mut last_written = self.last_written[txn].lock();
        let mut wrote_new_location = false;

        for (index, store) in self.stores.iter().enumerate() {
            let empty = WriteSet::new();
            let writes = write_sets.get(index).unwrap_or(&empty);
            for (key, value) in writes {
                match value {
                    Some(value) => store.write(key, value.clone(), version),
                    None => store.delete(key, version),
                }
            }

            let next: Vec<Key> = writes.keys().cloned().collect();
            let (removed, added) = diff_locations(&last_written[index], &next);
            for key in removed {
                store.remove(&key, txn);
            }
            wrote_new_location |= added;
            last_written[index] = next;
        }
        wrote_new_location
    }

    /// Publishes the read set of `txn`'s latest incarnation and returns the
    /// previous one when no validator still holds it.
    pub fn record_read_set(&self, txn: TxnIndex, read_set: TxnReadSet) -> Option<TxnReadSet> {
        let previous = self.last_read_set[txn].swap(Some(Arc::new(read_set)))?;
        Arc::try_unwrap(previous).ok()
    }

    /// Re-checks the last recorded read set of `txn` against the current
    /// contents of memory.
    pub fn validate_read_set(&self, txn: TxnIndex) -> bool {
        let Some(read_set) = self.last_read_set[txn].load_full() else {
            return true;
        };
        self.stores
            .iter()
            .zip(read_set.stores.iter())
            .all(|(store, reads)| store.validate_read_set(txn, reads, self.storage))
    }

    /// Marks every location `txn` last wrote as an estimate.
    pub fn convert_writes_to_estimates(&self, txn: TxnIndex) {
        let last_written = self.last_written[txn].lock();
        for (store, keys) in self.stores.iter().zip(last_written.iter()) {
            store.mark_estimates(txn, keys);
        }
    }

    /// Removes any estimate `txn` left behind.
    pub fn clear_estimates(&self, txn: TxnIndex) {
        let last_written = self.last_written[txn].lock();
        for (store, keys) in self.stores.iter().zip(last_written.iter()) {
            store.clear_estimates(txn, keys);
        }
    }

    /// Adds the winning write of every key of every store to `changes`.
    pub fn snapshot_to(&self, changes: &mut ChangeSet) -> Result<()> {
        for store in &self.stores {
            store.snapshot_to(changes)?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Result<ChangeSet> {
        let mut changes = ChangeSet::new(self.stores.len());
        self.snapshot_to(&mut changes)?;
        Ok(changes)
    }
}

/// Compares two sorted key lists. Returns the keys only in `prev` and whether
/// `next` has any key `prev` lacks.
fn diff_locations(prev: &[Key], next: &[Key]) -> (Vec<Key>, bool) {
    let mut removed = Vec::new();
    let mut added = false;
    let (mut i, mut j) = (0, 0);

    while i < prev.len() && j < next.len() {
        match prev[i].cmp(&next[j]) {
            Ordering::Less => {
                removed.push(prev[i].clone());
                i += 1;
            }
            Ordering::Greater => {
                added = true;
                j += 1;
            }
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    removed.extend(prev[i..].iter().cloned());
    added |= j < next.len();
    (removed, added)
}
