//! Adapter implementation of [`std::collections::BTreeMap`].
//!
//! ## Configuration Format
//!
//! ``` toml
//! [store]
//! name = "btreemap"
//! ```
//!
//! The map sits behind a single [`RwLock`]. Bulk writes and generic transactions take the write
//! lock once, so every generic transaction is atomic.

use crate::batch::{GenericBatch, GenericOp, KVBatch, ReadSlots};
use crate::error::StoreError;
use crate::stores::{BenchKVStore, Registry};
use crate::{KVStore, KVStoreHandle};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

type Map = BTreeMap<Box<[u8]>, Box<[u8]>>;

#[derive(Clone, Default)]
pub struct BTreeMapStore(Arc<RwLock<Map>>);

impl BTreeMapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_benchkvstore(_opt: &toml::Table) -> Result<BenchKVStore, StoreError> {
        Ok(BenchKVStore::from_store(Self::new()))
    }
}

fn copy_into(value: &[u8], buf: &mut [u8]) -> usize {
    let n = value.len().min(buf.len());
    buf[..n].copy_from_slice(&value[..n]);
    value.len()
}

impl KVStore for BTreeMapStore {
    fn handle(&self) -> Box<dyn KVStoreHandle> {
        Box::new(self.clone())
    }

    fn size(&self) -> u64 {
        self.0.read().len() as u64
    }
}

impl KVStoreHandle for BTreeMapStore {
    fn get(&mut self, key: &[u8], buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        Ok(self.0.read().get(key).map(|v| copy_into(v, buf)))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.0.write().insert(key.into(), value.into());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.0.write().remove(key);
        Ok(())
    }

    fn get_range(
        &mut self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        let map = self.0.read();
        Ok(map
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn put_bulk(&mut self, batch: &KVBatch) -> Result<(), StoreError> {
        let mut map = self.0.write();
        for (key, value) in batch.iter() {
            map.insert(key.into(), value.into());
        }
        Ok(())
    }

    fn generic(&mut self, batch: &GenericBatch, out: &mut ReadSlots) -> Result<(), StoreError> {
        out.reset();
        let mut map = self.0.write();
        for (i, op) in batch.ops().enumerate() {
            match op {
                GenericOp::Read { key } => {
                    if let Some(v) = map.get(key) {
                        out.fill(i, v)?;
                    }
                }
                GenericOp::Write { key, value } => {
                    map.insert(key.into(), value.into());
                }
            }
        }
        Ok(())
    }
}

inventory::submit! {
    Registry::new("btreemap", BTreeMapStore::new_benchkvstore)
}
