#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! A workload harness for benchmarking ordered key-value stores, in the style of YCSB.
//!
//! With `ordbench`, you describe a workload in TOML: the proportions of reads, updates, inserts,
//! scans, read-modify-writes and batched multi-key transactions, the key space and its access
//! pattern, value sizes, and how long to run. The harness first populates the store with a set of
//! population workers, then drives the configured traffic with a set of traffic workers, and
//! records per-second throughput and sampled latencies for every worker.
//!
//! You can also plug your own store into `ordbench`. All you need is implementing the [`KVStore`]
//! and [`KVStoreHandle`] traits. After registering your store, simply reuse the exported
//! [`cmdline()`] in your `main` function and it will work seamlessly with your own store.
//!
//! A few key design choices include:
//!
//! - Keys and values are plain byte slices. Keys have a fixed size and a layout chosen in the
//! configuration, so that the key order seen by the store is under control.
//! - Every random stream is derived from a single seed, so a run can be replayed exactly.
//! - Statistics use bounded memory: one-second epochs with fixed-size latency reservoirs.
//! - The store and the benchmark configuration are created dynamically from TOML and dynamically
//! dispatched; new stores are registered without touching this crate.
//!
//! More detailed usage could be found in the module-level rustdocs:
//!
//! - [`mod@bench`] for the config format of a benchmark.
//! - [`mod@distribution`] for the distribution strings.
//! - [`mod@stats`] for the output format.
//! - [`mod@stores`] for the config format of a built-in key-value store.
//! - [`cmdline()`] for the usage of the default command line interface.

use crate::batch::{GenericBatch, GenericOp, KVBatch, ReadSlots};
use crate::error::StoreError;

/// A shared, thread-safe ordered key-value store.
///
/// Each worker thread creates its own [`KVStoreHandle`] from it. Only [`KVStore::handle`] is
/// required; the other hooks default to no-ops.
pub trait KVStore: Send + Sync + 'static {
    /// Called once before the population phase.
    fn init(&self) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    /// Called once after all workers have been joined.
    fn shutdown(&self) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    /// Create a handle for the calling thread.
    fn handle(&self) -> Box<dyn KVStoreHandle>;

    fn thread(&self) -> Box<dyn crate::thread::Thread> {
        Box::new(self::thread::DefaultThread)
    }

    /// Print store-specific diagnostics. Called periodically during a run.
    fn print_stats(&self) {}

    /// Number of keys in the store, if the store keeps track of it.
    fn size(&self) -> u64 {
        0
    }
}

/// Begin and commit latency of the last transaction executed through a handle, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnTiming {
    pub begin: u64,
    pub commit: u64,
}

/// A per-thread handle of a [`KVStore`].
///
/// Every call is blocking. A key that does not exist is not an error.
pub trait KVStoreHandle {
    /// Called on the worker thread before its first operation.
    fn thread_local_entry(&mut self) {}

    /// Called on the worker thread after its last operation.
    fn thread_local_exit(&mut self) {}

    /// Copy the value of `key` into `buf` and return its true length, which may exceed
    /// `buf.len()`. In that case only the first `buf.len()` bytes are copied.
    fn get(
        &mut self,
        key: &[u8],
        buf: &mut [u8],
    ) -> std::result::Result<Option<usize>, StoreError>;

    /// Insert a new key-value pair or blindly overwrite an existing one.
    fn put(&mut self, key: &[u8], value: &[u8]) -> std::result::Result<(), StoreError>;

    fn delete(&mut self, _key: &[u8]) -> std::result::Result<(), StoreError> {
        Err(StoreError::Unsupported("delete"))
    }

    /// All pairs with `start <= key < end`, in key order.
    fn get_range(
        &mut self,
        start: &[u8],
        end: &[u8],
    ) -> std::result::Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError>;

    /// Write a batch of pairs. Defaults to one [`KVStoreHandle::put`] per pair.
    fn put_bulk(&mut self, batch: &KVBatch) -> std::result::Result<(), StoreError> {
        for (key, value) in batch.iter() {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// Execute all sub-operations of `batch` as a single unit. The value read by the `i`-th
    /// sub-operation goes into slot `i` of `out`.
    ///
    /// The default executes the sub-operations one by one, without atomicity.
    fn generic(
        &mut self,
        batch: &GenericBatch,
        out: &mut ReadSlots,
    ) -> std::result::Result<(), StoreError> {
        out.reset();
        let mut buf = vec![0u8; out.slot_size()];
        for (i, op) in batch.ops().enumerate() {
            match op {
                GenericOp::Read { key } => {
                    if let Some(len) = self.get(key, &mut buf)? {
                        out.record(i, &buf[..len.min(buf.len())], len)?;
                    }
                }
                GenericOp::Write { key, value } => self.put(key, value)?,
            }
        }
        Ok(())
    }

    /// Timing of the last transaction, for stores that measure it.
    fn txn_timing(&self) -> Option<TxnTiming> {
        None
    }
}

pub mod batch;
pub mod bench;
mod cmdline;
pub mod distribution;
pub mod error;
pub mod stats;
pub mod stores;
pub mod thread;
pub mod workload;

pub use cmdline::cmdline;
pub use error::{Error, Result};

pub extern crate inventory;
pub extern crate toml;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    // Only the required methods, so every other call goes through the trait defaults.
    #[derive(Default)]
    struct MinimalHandle(BTreeMap<Vec<u8>, Vec<u8>>);

    impl KVStoreHandle for MinimalHandle {
        fn get(
            &mut self,
            key: &[u8],
            buf: &mut [u8],
        ) -> std::result::Result<Option<usize>, StoreError> {
            Ok(self.0.get(key).map(|v| {
                let n = v.len().min(buf.len());
                buf[..n].copy_from_slice(&v[..n]);
                v.len()
            }))
        }

        fn put(&mut self, key: &[u8], value: &[u8]) -> std::result::Result<(), StoreError> {
            self.0.insert(key.to_vec(), value.to_vec());
            Ok(())
        }

        fn get_range(
            &mut self,
            start: &[u8],
            end: &[u8],
        ) -> std::result::Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
            Ok(self
                .0
                .range(start.to_vec()..end.to_vec())
                .map(|(k, v)| (k.clone().into_boxed_slice(), v.clone().into_boxed_slice()))
                .collect())
        }
    }

    struct MinimalStore;

    impl KVStore for MinimalStore {
        fn handle(&self) -> Box<dyn KVStoreHandle> {
            Box::new(MinimalHandle::default())
        }
    }

    #[test]
    fn default_hooks() {
        let store = MinimalStore;
        assert_eq!(store.init(), Ok(()));
        assert_eq!(store.shutdown(), Ok(()));
        assert_eq!(store.size(), 0);
        let mut handle = store.handle();
        handle.thread_local_entry();
        assert_eq!(handle.delete(b"foo"), Err(StoreError::Unsupported("delete")));
        assert_eq!(handle.txn_timing(), None);
        handle.thread_local_exit();
    }

    #[test]
    fn default_bulk_and_generic() {
        let mut handle = MinimalHandle::default();
        let mut batch = KVBatch::with_capacity(2, 3, 3);
        batch.push(b"k01", b"v01");
        batch.push(b"k02", b"v02");
        handle.put_bulk(&batch).unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(handle.get(b"k02", &mut buf), Ok(Some(3)));
        assert_eq!(&buf, b"v02");

        let mut generic = GenericBatch::new(3, 3, 3);
        generic.push_read(b"k01").unwrap();
        generic.push_write(b"k03", b"v03").unwrap();
        generic.push_read(b"k09").unwrap();
        let mut slots = ReadSlots::new(3, 3);
        handle.generic(&generic, &mut slots).unwrap();
        assert_eq!(slots.value(0), Some(&b"v01"[..]));
        assert_eq!(slots.value(2), None);
        assert_eq!(handle.get_range(b"k00", b"k09").unwrap().len(), 3);
    }
}
