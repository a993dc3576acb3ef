use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};
use crate::factory::{BackendRegistry, MEMORY_BACKEND, PoolRegistry};
use crate::pool::{Algorithm, PoolSpec};
use crate::sql::{DEFAULT_BUSY_TIMEOUT, SqlStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub pools: Vec<PoolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database: PathBuf,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub backend: String,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    #[serde(default)]
    pub algorithm: Algorithm,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            pools: vec![PoolConfig {
                name: "default".to_string(),
                backend: MEMORY_BACKEND.to_string(),
                pool_start: Ipv4Addr::new(192, 168, 1, 100),
                pool_end: Ipv4Addr::new(192, 168, 1, 200),
                algorithm: Algorithm::Random,
            }],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("dhcppool.db"),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks the config against the built-in backends.
    pub fn validate(&self) -> Result<()> {
        self.validate_with(&BackendRegistry::default())
    }

    /// Checks the config, accepting the backend keys known to `registry`.
    pub fn validate_with(&self, registry: &BackendRegistry) -> Result<()> {
        if self.storage.busy_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "busy_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for pool in &self.pools {
            if pool.name.is_empty() {
                return Err(Error::InvalidConfig(
                    "pool name must not be empty".to_string(),
                ));
            }
            if !names.insert(pool.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "pool {} is defined more than once",
                    pool.name
                )));
            }
            if !registry.contains(&pool.backend) {
                return Err(Error::UnknownBackend(pool.backend.clone()));
            }
            pool.validate()?;
        }

        Ok(())
    }

    pub fn pool(&self, name: &str) -> Option<&PoolConfig> {
        self.pools.iter().find(|pool| pool.name == name)
    }

    /// Creates every configured pool with the backends in `registry`.
    ///
    /// The store is opened only if at least one pool needs it.
    pub fn build_pools(&self, registry: &BackendRegistry) -> Result<PoolRegistry> {
        self.validate_with(registry)?;

        let needs_store = self
            .pools
            .iter()
            .any(|pool| registry.needs_storage(&pool.backend) == Some(true));

        let store = if needs_store {
            info!("Opening pool storage {}", self.storage.database.display());
            Some(SqlStore::open(
                &self.storage.database,
                self.storage.busy_timeout(),
            )?)
        } else {
            None
        };

        let mut pools = PoolRegistry::new();
        for pool in &self.pools {
            pools.insert(registry.create(&pool.backend, pool.spec()?, store.as_ref())?);
        }
        Ok(pools)
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_start > self.pool_end {
            return Err(Error::InvalidConfig(format!(
                "pool {}: pool_start must be less than or equal to pool_end",
                self.name
            )));
        }

        if self.pool_size().is_none() {
            return Err(Error::InvalidConfig(format!(
                "pool {}: range covers the whole address space",
                self.name
            )));
        }

        Ok(())
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        let start = u32::from(self.pool_start);
        let end = u32::from(self.pool_end);
        addr >= start && addr <= end
    }

    /// Number of addresses in the range, or `None` if the range is reversed
    /// or too large to index with a `u32`.
    pub fn pool_size(&self) -> Option<u32> {
        u32::from(self.pool_end)
            .checked_sub(u32::from(self.pool_start))?
            .checked_add(1)
    }

    /// Address of slot `index`, or `None` if the index is outside the range.
    pub fn address_of(&self, index: u32) -> Option<Ipv4Addr> {
        if index >= self.pool_size()? {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.pool_start) + index))
    }

    /// Slot index of `ip`, or `None` if the address is outside the range.
    pub fn index_of(&self, ip: Ipv4Addr) -> Option<u32> {
        if !self.ip_in_pool(ip) {
            return None;
        }
        Some(u32::from(ip) - u32::from(self.pool_start))
    }

    pub fn spec(&self) -> Result<PoolSpec> {
        self.validate()?;
        let capacity = self.pool_size().ok_or_else(|| {
            Error::InvalidConfig(format!("pool {}: range cannot be indexed", self.name))
        })?;
        Ok(PoolSpec::new(self.name.clone(), capacity).with_algorithm(self.algorithm))
    }
}
