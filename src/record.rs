//! Core record types shared by every node layout.

use std::sync::atomic::{AtomicU64, Ordering};

/// Key type of the index. Totally ordered, 8 bytes.
pub type Key = u64;

/// Opaque payload. Zero is reserved and encodes "no payload" (tombstone).
pub type Value = u64;

/// Lowest representable key, reserved as the empty-slot sentinel.
pub const KEY_MIN: Key = 0;

/// Highest representable key, reserved as the "+infinity" split-key sentinel
/// of the last leaf in the chain.
pub const KEY_MAX: Key = u64::MAX;

/// Tombstone payload.
pub const NO_VALUE: Value = 0;

/// A key/payload pair, 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Record {
    pub key: Key,
    pub val: Value,
}

impl Record {
    pub fn new(key: Key, val: Value) -> Self {
        Record { key, val }
    }

    /// A record whose payload has been tombstoned is not live.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.val != NO_VALUE
    }
}

/// One record slot readable by optimistic readers.
///
/// Key and payload are separate atomic words; torn pairs are ruled out by the
/// versioned-lock protocol of the enclosing bucket or piece, not by the cell
/// itself. All accesses are relaxed for that reason.
#[derive(Debug)]
pub(crate) struct SlotCell {
    key: AtomicU64,
    val: AtomicU64,
}

impl SlotCell {
    pub(crate) fn empty() -> Self {
        SlotCell {
            key: AtomicU64::new(KEY_MIN),
            val: AtomicU64::new(NO_VALUE),
        }
    }

    #[inline]
    pub(crate) fn key(&self) -> Key {
        self.key.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn val(&self) -> Value {
        self.val.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn load(&self) -> Record {
        Record {
            key: self.key(),
            val: self.val(),
        }
    }

    #[inline]
    pub(crate) fn store(&self, rec: Record) {
        self.key.store(rec.key, Ordering::Relaxed);
        self.val.store(rec.val, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_val(&self, val: Value) {
        self.val.store(val, Ordering::Relaxed);
    }
}

/// Allocate a boxed slice of empty cells.
pub(crate) fn empty_cells(n: usize) -> Box<[SlotCell]> {
    std::iter::repeat_with(SlotCell::empty).take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ordering_is_by_key_first() {
        let a = Record::new(1, 900);
        let b = Record::new(2, 100);
        assert!(a < b);
    }

    #[test]
    fn cell_roundtrip() {
        let cell = SlotCell::empty();
        assert_eq!(cell.load(), Record::new(KEY_MIN, NO_VALUE));
        cell.store(Record::new(42, 7));
        assert_eq!(cell.load(), Record::new(42, 7));
        cell.set_val(NO_VALUE);
        assert!(!cell.load().is_live());
    }
}
