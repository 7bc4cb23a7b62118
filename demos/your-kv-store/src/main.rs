//! How to add your implementation to `ordbench`.

extern crate ordbench;

use ordbench::error::StoreError;
use ordbench::inventory;
use ordbench::toml;

use ordbench::stores::{BenchKVStore, Registry};
use ordbench::{KVStore, KVStoreHandle};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct YourKVStore(Arc<Mutex<BTreeMap<Box<[u8]>, Box<[u8]>>>>);

impl YourKVStore {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(BTreeMap::new())))
    }

    pub fn new_benchkvstore(_opt: &toml::Table) -> Result<BenchKVStore, StoreError> {
        Ok(BenchKVStore::from_store(Self::new()))
    }

    fn map(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Box<[u8]>, Box<[u8]>>>, StoreError> {
        self.0
            .lock()
            .map_err(|_| StoreError::Failed("poisoned lock".to_string()))
    }
}

impl KVStore for YourKVStore {
    fn handle(&self) -> Box<dyn KVStoreHandle> {
        Box::new(self.clone())
    }
}

impl KVStoreHandle for YourKVStore {
    fn get(&mut self, key: &[u8], buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        Ok(self.map()?.get(key).map(|v| {
            let n = v.len().min(buf.len());
            buf[..n].copy_from_slice(&v[..n]);
            v.len()
        }))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.map()?.insert(key.into(), value.into());
        Ok(())
    }

    fn get_range(
        &mut self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        Ok(self
            .map()?
            .iter()
            .skip_while(|(k, _)| &***k < start)
            .take_while(|(k, _)| &***k < end)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

inventory::submit! {
    Registry::new("your_kv_store", YourKVStore::new_benchkvstore)
}

fn main() {
    // Call the `cmdline()` function directly here, and you will get the same benchmark binary
    // that contains your store and all the built-in stores in `ordbench`.
    ordbench::cmdline();
}
