//! Backend selection and the set of live pools.
//!
//! [`BackendRegistry`] maps a backend key (`"memory"`, `"sqlite"`) to a
//! constructor. [`PoolRegistry`] holds the pools a server created and is
//! passed explicitly to whatever handles requests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::info;

use crate::backend::PoolBackend;
use crate::error::{Error, Result};
use crate::memory::MemoryPool;
use crate::pool::PoolSpec;
use crate::sql::{SqlPool, SqlStore};

/// Key of the in-memory backend.
pub const MEMORY_BACKEND: &str = "memory";

/// Key of the SQLite-backed durable backend.
pub const SQLITE_BACKEND: &str = "sqlite";

/// Builds a pool from its spec and an optional storage handle.
pub type BackendConstructor = fn(PoolSpec, Option<&SqlStore>) -> Result<Arc<dyn PoolBackend>>;

#[derive(Debug, Clone, Copy)]
struct Registration {
    constructor: BackendConstructor,
    needs_storage: bool,
}

/// Name-keyed registry of backend constructors.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Registration>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(MEMORY_BACKEND, false, new_memory_pool);
        registry.register(SQLITE_BACKEND, true, new_sql_pool);
        registry
    }
}

impl BackendRegistry {
    /// A registry with no backends at all.
    pub fn empty() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Registers `constructor` under `key`, replacing any previous one.
    ///
    /// `needs_storage` tells [`Config::build_pools`](crate::Config::build_pools)
    /// to open the store before constructing pools of this kind.
    pub fn register(
        &mut self,
        key: impl Into<String>,
        needs_storage: bool,
        constructor: BackendConstructor,
    ) {
        self.backends.insert(
            key.into(),
            Registration {
                constructor,
                needs_storage,
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.backends.contains_key(key)
    }

    /// Returns `None` for unknown keys.
    pub fn needs_storage(&self, key: &str) -> Option<bool> {
        self.backends
            .get(key)
            .map(|registration| registration.needs_storage)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Instantiates a pool with the backend registered under `key`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownBackend`] for an unregistered key,
    /// [`Error::MissingStorage`] if the backend needs a store and none was
    /// given, or whatever the constructor fails with.
    pub fn create(
        &self,
        key: &str,
        spec: PoolSpec,
        store: Option<&SqlStore>,
    ) -> Result<Arc<dyn PoolBackend>> {
        let registration = self
            .backends
            .get(key)
            .ok_or_else(|| Error::UnknownBackend(key.to_string()))?;

        if registration.needs_storage && store.is_none() {
            return Err(Error::MissingStorage(key.to_string()));
        }

        (registration.constructor)(spec, store)
    }
}

fn new_memory_pool(spec: PoolSpec, _store: Option<&SqlStore>) -> Result<Arc<dyn PoolBackend>> {
    Ok(Arc::new(MemoryPool::new(spec)))
}

fn new_sql_pool(spec: PoolSpec, store: Option<&SqlStore>) -> Result<Arc<dyn PoolBackend>> {
    let store = store.ok_or_else(|| Error::MissingStorage(SQLITE_BACKEND.to_string()))?;
    Ok(Arc::new(SqlPool::create(spec, store)?))
}

/// The pools owned by one server, by name.
#[derive(Debug, Clone, Default)]
pub struct PoolRegistry {
    pools: BTreeMap<String, Arc<dyn PoolBackend>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `pool` under its own name, returning the pool it replaced.
    pub fn insert(&mut self, pool: Arc<dyn PoolBackend>) -> Option<Arc<dyn PoolBackend>> {
        info!(
            "Registered pool {} ({} addresses)",
            pool.name(),
            pool.capacity()
        );
        self.pools.insert(pool.name().to_string(), pool)
    }

    /// # Errors
    ///
    /// [`Error::UnknownPool`] if no pool has this name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn PoolBackend>> {
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownPool(name.to_string()))
    }

    /// Pool names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PoolBackend>> {
        self.pools.values()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
