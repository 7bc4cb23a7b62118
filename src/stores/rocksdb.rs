//! Adapter implementation of [`rocksdb`].
//!
//! ## Configuration Format
//!
//! ``` toml
//! [store]
//! name = "rocksdb"
//! path = "..." # path to the rocksdb data directory
//! ```
//!
//! Bulk writes and the writes of a generic transaction go through a single [`WriteBatch`]. Reads
//! of a generic transaction are not isolated from concurrent writers, and do not see the writes of
//! their own transaction.

use crate::batch::{GenericBatch, GenericOp, KVBatch, ReadSlots};
use crate::error::StoreError;
use crate::stores::{BenchKVStore, Registry};
use crate::{KVStore, KVStoreHandle};
use log::info;
use rocksdb::{Direction, IteratorMode, WriteBatch, DB};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct RocksDBOpt {
    pub path: String,
}

#[derive(Clone)]
pub struct RocksDB {
    db: Arc<DB>,
}

fn failed(e: rocksdb::Error) -> StoreError {
    StoreError::Failed(e.into_string())
}

impl RocksDB {
    pub fn new(opt: &RocksDBOpt) -> Result<Self, StoreError> {
        let db = DB::open_default(&opt.path).map_err(failed)?;
        info!("Opened rocksdb at {}", opt.path);
        Ok(Self { db: Arc::new(db) })
    }

    pub fn new_benchkvstore(opt: &toml::Table) -> Result<BenchKVStore, StoreError> {
        let opt: RocksDBOpt = opt
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| StoreError::Failed(e.to_string()))?;
        Ok(BenchKVStore::from_store(Self::new(&opt)?))
    }
}

impl KVStore for RocksDB {
    fn handle(&self) -> Box<dyn KVStoreHandle> {
        Box::new(self.clone())
    }

    fn shutdown(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(failed)
    }

    fn print_stats(&self) {
        if let Ok(Some(stats)) = self.db.property_value("rocksdb.stats") {
            info!("{}", stats);
        }
    }
}

impl KVStoreHandle for RocksDB {
    fn get(&mut self, key: &[u8], buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        let value = self.db.get_pinned(key).map_err(failed)?;
        Ok(value.map(|v| {
            let n = v.len().min(buf.len());
            buf[..n].copy_from_slice(&v[..n]);
            v.len()
        }))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.put(key, value).map_err(failed)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.db.delete(key).map_err(failed)
    }

    fn get_range(
        &mut self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let mut kv = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(start, Direction::Forward));
        for item in iter {
            let (k, v) = item.map_err(failed)?;
            if &*k >= end {
                break;
            }
            kv.push((k, v));
        }
        Ok(kv)
    }

    fn put_bulk(&mut self, batch: &KVBatch) -> Result<(), StoreError> {
        let mut wb = WriteBatch::default();
        for (key, value) in batch.iter() {
            wb.put(key, value);
        }
        self.db.write(wb).map_err(failed)
    }

    fn generic(&mut self, batch: &GenericBatch, out: &mut ReadSlots) -> Result<(), StoreError> {
        out.reset();
        let mut wb = WriteBatch::default();
        for (i, op) in batch.ops().enumerate() {
            match op {
                GenericOp::Read { key } => {
                    if let Some(v) = self.db.get_pinned(key).map_err(failed)? {
                        out.fill(i, &v)?;
                    }
                }
                GenericOp::Write { key, value } => wb.put(key, value),
            }
        }
        self.db.write(wb).map_err(failed)
    }
}

inventory::submit! {
    Registry::new("rocksdb", RocksDB::new_benchkvstore)
}
