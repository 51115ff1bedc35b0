//! Core types for Block-STM execution.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Transaction index in the block (0-based).
pub type TxnIndex = usize;

/// Incarnation number (how many times a transaction has been re-executed).
pub type Incarnation = usize;

/// Keys are opaque byte strings compared lexicographically.
///
/// Stored behind an `Arc` so that the multi-version structures, read sets and
/// iterator snapshots can share one copy.
pub type Key = Arc<[u8]>;

/// Default size limit under which written and read byte values are captured
/// for value-based validation.
pub const DEFAULT_CAPTURE_LIMIT: usize = 16 * 1024;

/// Version identifier for a transaction execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub txn_idx: TxnIndex,
    pub incarnation: Incarnation,
}

impl Version {
    pub fn new(txn_idx: TxnIndex, incarnation: Incarnation) -> Self {
        Self { txn_idx, incarnation }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.txn_idx, self.incarnation)
    }
}

/// Identifier of one of the block's named stores. The set of stores is fixed
/// when the block starts; the id is the store's position in the executor
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreId(pub u16);

impl StoreId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store#{}", self.0)
    }
}

/// Value domain of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    /// Byte values; equality is byte equality, which enables value-based
    /// validation of reads.
    #[default]
    Bytes,
    /// Opaque shared objects; only identity is known, reads are validated by
    /// version alone.
    Object,
}

/// Static description of one named store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub name: String,
    pub kind: StoreKind,
}

impl StoreConfig {
    pub fn bytes(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: StoreKind::Bytes }
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: StoreKind::Object }
    }
}

/// A value held in a store.
#[derive(Clone)]
pub enum Value {
    Bytes(Arc<[u8]>),
    Object(Arc<dyn Any + Send + Sync>),
}

impl Value {
    pub fn bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Value::Bytes(bytes.into())
    }

    pub fn object<T: Any + Send + Sync>(object: T) -> Self {
        Value::Object(Arc::new(object))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            Value::Object(_) => None,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Bytes(_) => None,
            Value::Object(object) => object.downcast_ref::<T>(),
        }
    }

    /// Byte equality for byte values, identity for objects.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bytes(bytes) => f.debug_tuple("Bytes").field(&&bytes[..]).finish(),
            Value::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes.into())
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.into())
    }
}

/// Half-open key range `[start, end)`; `None` bounds are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Option<Key>,
    pub end: Option<Key>,
}

impl KeyRange {
    pub fn new(start: Option<&[u8]>, end: Option<&[u8]>) -> Self {
        Self {
            start: start.map(Key::from),
            end: end.map(Key::from),
        }
    }

    pub fn full() -> Self {
        Self::default()
    }

    /// All keys beginning with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            start: Some(prefix.into()),
            end: prefix_end(prefix).map(Key::from),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.start.as_deref().map_or(true, |start| key >= start)
            && self.end.as_deref().map_or(true, |end| key < end)
    }
}

/// Smallest key strictly greater than every key starting with `prefix`.
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Iteration direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    /// Orders `a` relative to `b` in iteration order.
    pub(crate) fn order(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Direction::Ascending => a.cmp(b),
            Direction::Descending => b.cmp(a),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_range() {
        let range = KeyRange::prefix(b"iter/");
        assert!(range.contains(b"iter/00000001"));
        assert!(!range.contains(b"iter0"));
        assert!(!range.contains(b"ite"));

        let all = KeyRange::prefix(&[0xff, 0xff]);
        assert_eq!(all.end, None);
        assert!(all.contains(&[0xff, 0xff, 0x01]));
    }

    #[test]
    fn test_value_identity() {
        let a = Value::bytes(vec![1, 2]);
        let b = Value::bytes(vec![1, 2]);
        assert_eq!(a, b);

        let o1 = Value::object(7u64);
        let o2 = Value::object(7u64);
        assert_ne!(o1, o2);
        assert_eq!(o1, o1.clone());
        assert_eq!(o1.downcast_ref::<u64>(), Some(&7));
    }
}
