//! Reads recorded by one incarnation, replayed during validation.

use crate::types::{Direction, Key, KeyRange, Version};
use std::sync::Arc;

/// Value observed by a read, kept for value-based validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Captured {
    Absent,
    Bytes(Arc<[u8]>),
}

/// One point read. `version == None` means the value came from the pre-block
/// state.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadDescriptor {
    pub key: Key,
    pub version: Option<Version>,
    pub captured: Option<Captured>,
}

/// The exact sequence of keys a range iteration consumed from the
/// multi-version and pre-block layers.
#[derive(Debug, Clone, PartialEq)]
pub struct IteratorDescriptor {
    pub range: KeyRange,
    pub direction: Direction,
    pub reads: Vec<ReadDescriptor>,
    /// The iteration reached the end of the range, so an element appended
    /// after the last recorded one also invalidates it.
    pub exhausted: bool,
}

/// Point reads and iterations on a single store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadSet {
    pub reads: Vec<ReadDescriptor>,
    pub iterators: Vec<IteratorDescriptor>,
}

impl ReadSet {
    pub fn clear(&mut self) {
        self.reads.clear();
        self.iterators.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.iterators.is_empty()
    }
}

/// Read sets of one incarnation, indexed by store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxnReadSet {
    pub stores: Vec<ReadSet>,
}

impl TxnReadSet {
    pub fn with_stores(num_stores: usize) -> Self {
        Self {
            stores: vec![ReadSet::default(); num_stores],
        }
    }

    /// Empties every store's read set while keeping the allocations, so the
    /// buffers can back the next incarnation's view.
    pub fn reset(&mut self, num_stores: usize) {
        self.stores.iter_mut().for_each(ReadSet::clear);
        self.stores.resize_with(num_stores, ReadSet::default);
    }
}
