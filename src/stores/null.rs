//! A store that keeps nothing.
//!
//! ## Configuration Format
//!
//! ``` toml
//! [store]
//! name = "null"
//! ```
//!
//! Every read misses and every write is dropped. Useful to measure the overhead of the harness
//! itself.

use crate::error::StoreError;
use crate::stores::{BenchKVStore, Registry};
use crate::{KVStore, KVStoreHandle};

#[derive(Clone, Default)]
pub struct NullStore;

impl NullStore {
    pub fn new() -> Self {
        Self
    }

    pub fn new_benchkvstore(_opt: &toml::Table) -> Result<BenchKVStore, StoreError> {
        Ok(BenchKVStore::from_store(Self::new()))
    }
}

impl KVStore for NullStore {
    fn handle(&self) -> Box<dyn KVStoreHandle> {
        Box::new(self.clone())
    }
}

impl KVStoreHandle for NullStore {
    fn get(&mut self, _key: &[u8], _buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        Ok(None)
    }

    fn put(&mut self, _key: &[u8], _value: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete(&mut self, _key: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    fn get_range(
        &mut self,
        _start: &[u8],
        _end: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        Ok(Vec::new())
    }
}

inventory::submit! {
    Registry::new("null", NullStore::new_benchkvstore)
}
