//! Write-location hints supplied by the caller before a block starts.

use crate::error::{BlockStmError, Result};
use crate::types::{Key, StoreId, TxnIndex};
use std::collections::BTreeMap;

/// Keys each transaction is expected to write, per store.
///
/// Every listed `(store, key)` is seeded as an estimate of its transaction, so
/// later transactions that read it wait for the writer instead of running
/// optimistically against a value that is about to change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreEstimates {
    by_txn: BTreeMap<TxnIndex, BTreeMap<StoreId, Vec<Key>>>,
}

impl PreEstimates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, txn: TxnIndex, store: StoreId, key: impl Into<Key>) {
        self.by_txn
            .entry(txn)
            .or_default()
            .entry(store)
            .or_default()
            .push(key.into());
    }

    pub fn with(mut self, txn: TxnIndex, store: StoreId, key: impl Into<Key>) -> Self {
        self.insert(txn, store, key);
        self
    }

    /// All hints as `(txn, store, key)`, ordered by transaction then store.
    pub fn iter(&self) -> impl Iterator<Item = (TxnIndex, StoreId, &Key)> {
        self.by_txn.iter().flat_map(|(txn, stores)| {
            stores
                .iter()
                .flat_map(move |(store, keys)| keys.iter().map(move |key| (*txn, *store, key)))
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.by_txn.is_empty()
    }

    /// Rejects hints for transactions outside the block or unknown stores.
    pub fn validate(&self, num_txns: usize, num_stores: usize) -> Result<()> {
        for (txn, store, _) in self.iter() {
            if txn >= num_txns {
                return Err(BlockStmError::InvalidConfiguration(format!(
                    "pre-estimate for transaction {txn} in a block of {num_txns}"
                )));
            }
            if store.index() >= num_stores {
                return Err(BlockStmError::InvalidConfiguration(format!(
                    "pre-estimate for unknown {store}"
                )));
            }
        }
        Ok(())
    }
}
