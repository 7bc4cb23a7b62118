//! Owned buffers passed to the batched store calls.
//!
//! Workers reuse the same buffers across iterations. Every buffer keeps its own cursor and checks
//! lengths on insertion, so a store implementation only ever sees well-formed slices.

use thiserror::Error;

/// Misuse of a batch buffer.
#[derive(Debug, Error, PartialEq)]
pub enum BatchError {
    #[error("expected a {what} of {expected} bytes, got {got}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("batch is full ({0} operations)")]
    Full(usize),

    #[error("slot {slot} out of range ({slots} slots)")]
    OutOfRange { slot: usize, slots: usize },
}

// {{{ kvbatch

/// A list of key-value pairs for [`crate::KVStoreHandle::put_bulk`].
///
/// Keys and values are stored back to back; the end offset of every pair is recorded so pairs of
/// different sizes can be mixed.
#[derive(Debug, Default)]
pub struct KVBatch {
    keys: Vec<u8>,
    values: Vec<u8>,
    key_ends: Vec<usize>,
    value_ends: Vec<usize>,
}

impl KVBatch {
    pub fn with_capacity(pairs: usize, key_size: usize, value_size: usize) -> Self {
        Self {
            keys: Vec::with_capacity(pairs * key_size),
            values: Vec::with_capacity(pairs * value_size),
            key_ends: Vec::with_capacity(pairs),
            value_ends: Vec::with_capacity(pairs),
        }
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.values.clear();
        self.key_ends.clear();
        self.value_ends.clear();
    }

    pub fn push(&mut self, key: &[u8], value: &[u8]) {
        self.keys.extend_from_slice(key);
        self.values.extend_from_slice(value);
        self.key_ends.push(self.keys.len());
        self.value_ends.push(self.values.len());
    }

    pub fn len(&self) -> usize {
        self.key_ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_ends.is_empty()
    }

    /// The `i`-th pair.
    pub fn get(&self, i: usize) -> Option<(&[u8], &[u8])> {
        if i >= self.len() {
            return None;
        }
        let kstart = if i == 0 { 0 } else { self.key_ends[i - 1] };
        let vstart = if i == 0 { 0 } else { self.value_ends[i - 1] };
        Some((
            &self.keys[kstart..self.key_ends[i]],
            &self.values[vstart..self.value_ends[i]],
        ))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}

// }}} kvbatch

// {{{ genericbatch

/// One sub-operation of a generic transaction.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum GenericOp<'a> {
    Read { key: &'a [u8] },
    Write { key: &'a [u8], value: &'a [u8] },
}

/// The sub-operations of one generic transaction, submitted to the store as a single unit.
///
/// All keys have the same size and all written values have the same size, so sub-operations are
/// addressed by a constant stride.
#[derive(Debug)]
pub struct GenericBatch {
    key_size: usize,
    value_size: usize,
    arity: usize,
    keys: Vec<u8>,
    writes: Vec<bool>,
    values: Vec<u8>,
}

impl GenericBatch {
    pub fn new(arity: usize, key_size: usize, value_size: usize) -> Self {
        Self {
            key_size,
            value_size,
            arity,
            keys: Vec::with_capacity(arity * key_size),
            writes: Vec::with_capacity(arity),
            values: Vec::with_capacity(arity * value_size),
        }
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.writes.clear();
        self.values.clear();
    }

    pub fn push_read(&mut self, key: &[u8]) -> Result<(), BatchError> {
        self.push_key(key)?;
        self.writes.push(false);
        Ok(())
    }

    pub fn push_write(&mut self, key: &[u8], value: &[u8]) -> Result<(), BatchError> {
        if value.len() != self.value_size {
            return Err(BatchError::SizeMismatch {
                what: "value",
                expected: self.value_size,
                got: value.len(),
            });
        }
        self.push_key(key)?;
        self.writes.push(true);
        self.values.extend_from_slice(value);
        Ok(())
    }

    fn push_key(&mut self, key: &[u8]) -> Result<(), BatchError> {
        if self.writes.len() == self.arity {
            return Err(BatchError::Full(self.arity));
        }
        if key.len() != self.key_size {
            return Err(BatchError::SizeMismatch {
                what: "key",
                expected: self.key_size,
                got: key.len(),
            });
        }
        self.keys.extend_from_slice(key);
        Ok(())
    }

    /// Number of sub-operations pushed so far.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn nr_reads(&self) -> usize {
        self.writes.iter().filter(|w| !**w).count()
    }

    pub fn nr_writes(&self) -> usize {
        self.writes.iter().filter(|w| **w).count()
    }

    /// Sub-operations in submission order.
    pub fn ops(&self) -> impl Iterator<Item = GenericOp<'_>> + '_ {
        let mut w = 0;
        self.writes.iter().enumerate().map(move |(i, write)| {
            let key = &self.keys[i * self.key_size..(i + 1) * self.key_size];
            if *write {
                let value = &self.values[w * self.value_size..(w + 1) * self.value_size];
                w += 1;
                GenericOp::Write { key, value }
            } else {
                GenericOp::Read { key }
            }
        })
    }
}

// }}} genericbatch

// {{{ readslots

/// Output buffer of a generic transaction: one fixed-size slot per sub-operation.
///
/// A value larger than its slot is truncated, while its true length is still recorded.
#[derive(Debug)]
pub struct ReadSlots {
    slot_size: usize,
    buf: Vec<u8>,
    lens: Vec<Option<usize>>,
}

impl ReadSlots {
    pub fn new(slots: usize, slot_size: usize) -> Self {
        Self {
            slot_size,
            buf: vec![0u8; slots * slot_size],
            lens: vec![None; slots],
        }
    }

    pub fn reset(&mut self) {
        self.lens.iter_mut().for_each(|l| *l = None);
    }

    /// Copy `value` into `slot`, returning the number of bytes actually copied.
    pub fn fill(&mut self, slot: usize, value: &[u8]) -> Result<usize, BatchError> {
        self.record(slot, value, value.len())
    }

    /// Like [`ReadSlots::fill`], for a value already cut down from `true_len` bytes.
    pub fn record(
        &mut self,
        slot: usize,
        value: &[u8],
        true_len: usize,
    ) -> Result<usize, BatchError> {
        if slot >= self.lens.len() {
            return Err(BatchError::OutOfRange {
                slot,
                slots: self.lens.len(),
            });
        }
        let n = value.len().min(self.slot_size);
        let start = slot * self.slot_size;
        self.buf[start..start + n].copy_from_slice(&value[..n]);
        self.lens[slot] = Some(true_len.max(n));
        Ok(n)
    }

    /// The (possibly truncated) value read into `slot`, if any.
    pub fn value(&self, slot: usize) -> Option<&[u8]> {
        let len = (*self.lens.get(slot)?)?;
        let start = slot * self.slot_size;
        Some(&self.buf[start..start + len.min(self.slot_size)])
    }

    /// The true length of the value read into `slot`.
    pub fn true_len(&self, slot: usize) -> Option<usize> {
        *self.lens.get(slot)?
    }

    pub fn slots(&self) -> usize {
        self.lens.len()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }
}

// }}} readslots

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kvbatch_mixed_sizes() {
        let mut batch = KVBatch::with_capacity(3, 4, 4);
        batch.push(b"k0", b"v");
        batch.push(b"key1", b"value1");
        batch.push(b"k2", b"");
        assert_eq!(batch.len(), 3);
        let pairs: Vec<_> = batch.iter().collect();
        assert_eq!(pairs[0], (&b"k0"[..], &b"v"[..]));
        assert_eq!(pairs[1], (&b"key1"[..], &b"value1"[..]));
        assert_eq!(pairs[2], (&b"k2"[..], &b""[..]));
        assert!(batch.get(3).is_none());
        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn generic_batch_checks_sizes() {
        let mut batch = GenericBatch::new(2, 4, 3);
        assert_eq!(
            batch.push_read(b"abc"),
            Err(BatchError::SizeMismatch {
                what: "key",
                expected: 4,
                got: 3
            })
        );
        assert_eq!(
            batch.push_write(b"abcd", b"toolong"),
            Err(BatchError::SizeMismatch {
                what: "value",
                expected: 3,
                got: 7
            })
        );
        assert!(batch.push_write(b"abcd", b"xyz").is_ok());
        assert!(batch.push_read(b"efgh").is_ok());
        assert_eq!(batch.push_read(b"ijkl"), Err(BatchError::Full(2)));
        let ops: Vec<_> = batch.ops().collect();
        assert_eq!(
            ops,
            vec![
                GenericOp::Write {
                    key: b"abcd",
                    value: b"xyz"
                },
                GenericOp::Read { key: b"efgh" },
            ]
        );
        assert_eq!(batch.nr_reads(), 1);
        assert_eq!(batch.nr_writes(), 1);
    }

    #[test]
    fn read_slots_truncate() {
        let mut slots = ReadSlots::new(2, 4);
        assert_eq!(slots.fill(0, b"ab"), Ok(2));
        assert_eq!(slots.fill(1, b"abcdefgh"), Ok(4));
        assert_eq!(slots.value(0), Some(&b"ab"[..]));
        assert_eq!(slots.value(1), Some(&b"abcd"[..]));
        assert_eq!(slots.true_len(1), Some(8));
        assert!(slots.fill(2, b"x").is_err());
        assert_eq!(slots.record(0, b"abcd", 100), Ok(4));
        assert_eq!(slots.true_len(0), Some(100));
        slots.reset();
        assert!(slots.value(0).is_none());
    }
}
