//! Adapters for built-in and external key-value stores.
//!
//! ## Built-in Stores
//!
//! The usage of built-in stores can be found in the module-level documentations. Please note that
//! it may be necessary to enable specific features of the crate to enable a certain built-in
//! store.
//!
//! ## Registering New Stores
//!
//! When users would like to dynamically register new key-value stores from their own crate, first
//! of all, they need to implement the corresponding [`KVStore`]/[`KVStoreHandle`] for the store.
//! Then, they need to create a constructor function with a signature of
//! `fn(&toml::Table) -> Result<BenchKVStore, StoreError>`.
//!
//! The final step is to register the store's constructor (along with its name) using
//! [`inventory`]. A minimal example would be: `inventory::submit! { Registry::new("name",
//! constructor_fn) };`.
//!
//! The source code of all built-in stores provide good examples on this process.

use crate::bench::{bench, Benchmark, Control, Report};
use crate::error::{ConfigError, Result, StoreError};
use crate::KVStore;
use hashbrown::HashMap;
use log::debug;
use serde::Deserialize;
use std::sync::Arc;
use toml::Table;

/// A created key-value store that is ready to run.
pub struct BenchKVStore(pub(crate) Arc<Box<dyn KVStore>>);

impl BenchKVStore {
    pub fn from_store(store: impl KVStore) -> Self {
        Self(Arc::new(Box::new(store)))
    }

    /// Run `benchmark` against this store. See [`crate::bench::bench`].
    pub fn bench(&self, benchmark: &Benchmark, control: &Arc<Control>) -> Result<Report> {
        bench(self.0.clone(), benchmark, control)
    }
}

/// The centralized registry that maps the name of newly added key-value store to its constructor
/// function.
///
/// A user-defined store can use the [`inventory::submit!`] macro to register their own stores to
/// be used in the benchmark framework.
pub struct Registry<'a> {
    pub(crate) name: &'a str,
    constructor: fn(&Table) -> std::result::Result<BenchKVStore, StoreError>,
}

impl<'a> Registry<'a> {
    pub const fn new(
        name: &'a str,
        constructor: fn(&Table) -> std::result::Result<BenchKVStore, StoreError>,
    ) -> Self {
        Self { name, constructor }
    }
}

inventory::collect!(Registry<'static>);

/// The `[store]` table: a registered name plus whatever options that store reads.
#[derive(Deserialize, Clone, Debug)]
pub(crate) struct BenchKVStoreOpt {
    name: String,
    #[serde(flatten)]
    opt: Table,
}

/// Names of all registered stores, sorted.
pub fn registered() -> Vec<&'static str> {
    let mut names: Vec<_> = inventory::iter::<Registry>.into_iter().map(|r| r.name).collect();
    names.sort_unstable();
    names
}

impl BenchKVStore {
    pub(crate) fn new(opt: &BenchKVStoreOpt) -> Result<BenchKVStore> {
        // construct the hashmap.. this will be done every time
        let mut registered: HashMap<&'static str, _> = HashMap::new();
        for r in inventory::iter::<Registry> {
            debug!("Adding supported store: {}", r.name);
            if registered.insert(r.name, r.constructor).is_some() {
                return Err(ConfigError::Invalid(format!("store {} registered twice", r.name)).into());
            }
        }
        let f = registered
            .get(opt.name.as_str())
            .ok_or_else(|| ConfigError::UnknownStore(opt.name.clone()))?;
        Ok(f(&opt.opt)?)
    }
}

pub mod btreemap;
pub mod null;
#[cfg(feature = "rocksdb")]
pub mod rocksdb;
