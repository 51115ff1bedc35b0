//! Transaction-local view over multi-version memory.
//!
//! An [`ExecutionView`] is handed to the transaction callback for one
//! incarnation. Writes are buffered until the incarnation finishes; reads go
//! through the buffer, then [`MVMemory`], then backing storage, and are
//! recorded for validation.

use crate::error::Result;
use crate::iterator::{MergeCursor, Step};
use crate::mvmemory::{MVMemory, WriteSet};
use crate::mvstore::{MVRead, MVStore};
use crate::read_set::{Captured, IteratorDescriptor, ReadDescriptor, ReadSet, TxnReadSet};
use crate::scheduler::{wait_for, Scheduler};
use crate::types::{Direction, Incarnation, Key, KeyRange, StoreId, TxnIndex, Value, Version};
use std::cmp::Ordering;
use std::iter::Peekable;
use std::vec;

/// What a transaction sees while it executes.
pub struct ExecutionView<'a> {
    txn: TxnIndex,
    incarnation: Incarnation,
    memory: &'a MVMemory<'a>,
    scheduler: &'a Scheduler,
    write_sets: Vec<WriteSet>,
    read_set: TxnReadSet,
}

impl<'a> ExecutionView<'a> {
    /// `read_set` is a recycled buffer; it is cleared before use.
    pub(crate) fn new(
        version: Version,
        memory: &'a MVMemory<'a>,
        scheduler: &'a Scheduler,
        mut read_set: TxnReadSet,
    ) -> Self {
        read_set.reset(memory.num_stores());
        Self {
            txn: version.txn_idx,
            incarnation: version.incarnation,
            memory,
            scheduler,
            write_sets: vec![WriteSet::new(); memory.num_stores()],
            read_set,
        }
    }

    pub fn txn(&self) -> TxnIndex {
        self.txn
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub fn version(&self) -> Version {
        Version::new(self.txn, self.incarnation)
    }

    /// Access to one store. Fails with `UnknownStore` for ids outside the
    /// block's store set.
    pub fn store(&mut self, id: StoreId) -> Result<StoreView<'_, 'a>> {
        let store = self.memory.store(id)?;
        Ok(StoreView { view: self, store })
    }

    /// Flushes the buffered writes into multi-version memory. Returns whether
    /// a location the previous incarnation did not write was written, and the
    /// recorded read set.
    pub(crate) fn apply_writes(self) -> (bool, TxnReadSet) {
        let wrote_new_location = self.memory.apply_write_sets(self.version(), &self.write_sets);
        (wrote_new_location, self.read_set)
    }

    /// Drops every buffered write. A failed incarnation then flushes an empty
    /// write set, which removes what its earlier incarnations wrote.
    pub(crate) fn discard_writes(&mut self) {
        self.write_sets.iter_mut().for_each(WriteSet::clear);
    }

    /// Parks until `writer` finishes executing. Returns `false` if the block
    /// was cancelled, in which case the caller stops waiting on estimates.
    fn wait_for_writer(scheduler: &Scheduler, reader: TxnIndex, writer: TxnIndex) -> bool {
        if let Some(condvar) = scheduler.add_dependency(reader, writer) {
            wait_for(&condvar);
        }
        !scheduler.is_cancelled()
    }
}

/// One store of an [`ExecutionView`].
pub struct StoreView<'v, 'a> {
    view: &'v mut ExecutionView<'a>,
    store: &'a MVStore,
}

impl<'v, 'a> StoreView<'v, 'a> {
    pub fn id(&self) -> StoreId {
        self.store.id()
    }

    fn index(&self) -> usize {
        self.store.id().index()
    }

    pub fn get(&mut self, key: &[u8]) -> Option<Value> {
        let index = self.index();
        if let Some(buffered) = self.view.write_sets[index].get(key) {
            return buffered.clone();
        }

        let txn = self.view.txn;
        let (version, value, captured) = loop {
            match self.store.read(key, txn) {
                MVRead::Versioned { version, value, captured } => break (Some(version), value, captured),
                MVRead::Storage { cached } => {
                    let value = cached.unwrap_or_else(|| self.read_storage(key));
                    break (None, value.clone(), self.store.capture(value.as_ref()));
                }
                MVRead::Estimate { blocking } => {
                    if !ExecutionView::wait_for_writer(self.view.scheduler, txn, blocking) {
                        let value = self.read_storage(key);
                        break (None, value.clone(), self.store.capture(value.as_ref()));
                    }
                }
            }
        };

        self.record(key, version, captured);
        value
    }

    fn read_storage(&self, key: &[u8]) -> Option<Value> {
        let value = self.view.memory.storage().get(self.store.id(), key);
        self.store.cache_pre_state(key, value.clone());
        value
    }

    fn record(&mut self, key: &[u8], version: Option<Version>, captured: Option<Captured>) {
        let index = self.index();
        self.view.read_set.stores[index].reads.push(ReadDescriptor {
            key: key.into(),
            version,
            captured,
        });
    }

    /// Buffers a write. The last write of a key within one incarnation wins.
    pub fn set(&mut self, key: &[u8], value: impl Into<Value>) {
        let index = self.index();
        self.view.write_sets[index].insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: &[u8]) {
        let index = self.index();
        self.view.write_sets[index].insert(key.into(), None);
    }

    pub fn has(&mut self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Iterates `range` as the transaction would see it after every earlier
    /// transaction of the block, with its own buffered writes applied on top.
    pub fn iterator(&mut self, range: KeyRange, direction: Direction) -> StoreIterator<'_, 'a> {
        let index = self.index();
        let txn = self.view.txn;
        let scheduler = self.view.scheduler;
        let storage = self.view.memory.storage();

        let mut own: Vec<(Key, Option<Value>)> = self.view.write_sets[index]
            .iter()
            .filter(|(key, _)| range.contains(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if direction == Direction::Descending {
            own.reverse();
        }

        StoreIterator {
            txn,
            direction,
            scheduler,
            cursor: self.store.cursor(txn, &range, direction, storage),
            own: own.into_iter().peekable(),
            head: None,
            cursor_done: false,
            descriptor: IteratorDescriptor {
                range,
                direction,
                reads: Vec::new(),
                exhausted: false,
            },
            read_set: &mut self.view.read_set.stores[index],
        }
    }
}

/// Range iterator returned by [`StoreView::iterator`].
///
/// Every element taken from memory or storage is recorded, in order, and the
/// record is added to the read set when the iterator is dropped.
pub struct StoreIterator<'v, 'a> {
    txn: TxnIndex,
    direction: Direction,
    scheduler: &'a Scheduler,
    cursor: MergeCursor<'a>,
    own: Peekable<vec::IntoIter<(Key, Option<Value>)>>,
    head: Option<(Key, Value)>,
    cursor_done: bool,
    descriptor: IteratorDescriptor,
    read_set: &'v mut ReadSet,
}

impl StoreIterator<'_, '_> {
    fn pull(&mut self) -> Option<(Key, Value)> {
        loop {
            match self.cursor.next_step() {
                Step::Item { key, value, version } => {
                    self.descriptor.reads.push(ReadDescriptor {
                        key: key.clone(),
                        version,
                        captured: None,
                    });
                    return Some((key, value));
                }
                Step::Estimate(writer) => {
                    if !ExecutionView::wait_for_writer(self.scheduler, self.txn, writer) {
                        self.cursor_done = true;
                        return None;
                    }
                }
                Step::Done => {
                    self.descriptor.exhausted = true;
                    self.cursor_done = true;
                    return None;
                }
            }
        }
    }
}

impl Iterator for StoreIterator<'_, '_> {
    type Item = (Key, Value);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.head.is_none() && !self.cursor_done {
                self.head = self.pull();
            }

            let ordering = match (self.own.peek(), &self.head) {
                (None, None) => return None,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((own_key, _)), Some((key, _))) => self.direction.order(own_key, key),
            };

            match ordering {
                Ordering::Greater => return self.head.take(),
                // The transaction's own write shadows the shared one.
                Ordering::Equal => self.head = None,
                Ordering::Less => {}
            }

            if let Some((key, Some(value))) = self.own.next() {
                return Some((key, value));
            }
        }
    }
}

impl Drop for StoreIterator<'_, '_> {
    fn drop(&mut self) {
        let descriptor = IteratorDescriptor {
            range: self.descriptor.range.clone(),
            direction: self.direction,
            reads: std::mem::take(&mut self.descriptor.reads),
            exhausted: self.descriptor.exhausted,
        };
        self.read_set.iterators.push(descriptor);
    }
}
