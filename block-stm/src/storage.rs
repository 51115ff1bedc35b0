//! Backing multi-store interfaces.
//!
//! The engine reads the pre-block state through [`Storage`] from many worker
//! threads at once and only writes, through [`StorageMut`], after every
//! transaction of the block has been validated.

use crate::types::{Direction, Key, KeyRange, StoreId, Value};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Ordered iterator over `(key, value)` pairs of one store.
pub type BaseIter<'a> = Box<dyn Iterator<Item = (Key, Value)> + 'a>;

/// Read access to the pre-block state. Implementations must tolerate
/// concurrent callers.
pub trait Storage: Sync {
    /// Returns the value of `key` in `store`, or `None` if absent.
    fn get(&self, store: StoreId, key: &[u8]) -> Option<Value>;

    /// Iterates the keys of `store` inside `range` in the given direction.
    fn range(&self, store: StoreId, range: &KeyRange, direction: Direction) -> BaseIter<'_>;
}

/// Write access used when the final snapshot of a block is committed.
pub trait StorageMut: Storage {
    fn set(&mut self, store: StoreId, key: Key, value: Value);

    fn delete(&mut self, store: StoreId, key: &[u8]);
}

/// In-memory multi-store backed by one ordered map per store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemStorage {
    stores: Vec<BTreeMap<Key, Value>>,
}

impl MemStorage {
    /// Creates an empty storage with `num_stores` stores.
    pub fn new(num_stores: usize) -> Self {
        Self {
            stores: vec![BTreeMap::new(); num_stores],
        }
    }

    /// Returns the contents of one store.
    pub fn store(&self, store: StoreId) -> Option<&BTreeMap<Key, Value>> {
        self.stores.get(store.index())
    }

    pub fn num_stores(&self) -> usize {
        self.stores.len()
    }

    fn store_mut(&mut self, store: StoreId) -> &mut BTreeMap<Key, Value> {
        if self.stores.len() <= store.index() {
            self.stores.resize_with(store.index() + 1, BTreeMap::new);
        }
        &mut self.stores[store.index()]
    }
}

impl Storage for MemStorage {
    fn get(&self, store: StoreId, key: &[u8]) -> Option<Value> {
        self.stores.get(store.index())?.get(key).cloned()
    }

    fn range(&self, store: StoreId, range: &KeyRange, direction: Direction) -> BaseIter<'_> {
        let Some(map) = self.stores.get(store.index()) else {
            return Box::new(std::iter::empty());
        };
        if let (Some(start), Some(end)) = (&range.start, &range.end) {
            if start >= end {
                return Box::new(std::iter::empty());
            }
        }

        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (
            range.start.as_deref().map_or(Bound::Unbounded, Bound::Included),
            range.end.as_deref().map_or(Bound::Unbounded, Bound::Excluded),
        );
        let entries = map.range::<[u8], _>(bounds).map(|(k, v)| (k.clone(), v.clone()));
        match direction {
            Direction::Ascending => Box::new(entries),
            Direction::Descending => Box::new(entries.rev()),
        }
    }
}

impl StorageMut for MemStorage {
    fn set(&mut self, store: StoreId, key: Key, value: Value) {
        self.store_mut(store).insert(key, value);
    }

    fn delete(&mut self, store: StoreId, key: &[u8]) {
        self.store_mut(store).remove(key);
    }
}

/// The winning writes of a block, per store. `None` marks a deletion.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    stores: Vec<BTreeMap<Key, Option<Value>>>,
}

impl ChangeSet {
    pub fn new(num_stores: usize) -> Self {
        Self {
            stores: vec![BTreeMap::new(); num_stores],
        }
    }

    pub fn set(&mut self, store: StoreId, key: Key, value: Value) {
        self.stores[store.index()].insert(key, Some(value));
    }

    pub fn delete(&mut self, store: StoreId, key: Key) {
        self.stores[store.index()].insert(key, None);
    }

    /// Changes recorded for `store`, in key order.
    pub fn store(&self, store: StoreId) -> impl Iterator<Item = (&Key, Option<&Value>)> {
        self.stores
            .get(store.index())
            .into_iter()
            .flat_map(|changes| changes.iter().map(|(k, v)| (k, v.as_ref())))
    }

    pub fn len(&self) -> usize {
        self.stores.iter().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes every change into `storage`.
    pub fn apply_to<S: StorageMut + ?Sized>(self, storage: &mut S) {
        for (index, changes) in self.stores.into_iter().enumerate() {
            let store = StoreId(index as u16);
            for (key, value) in changes {
                match value {
                    Some(value) => storage.set(store, key, value),
                    None => storage.delete(store, &key),
                }
            }
        }
    }
}
