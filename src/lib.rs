//! # dhcppool
//!
//! Fixed-size IPv4 address pools for DHCP servers, shared safely between
//! workers and, with the durable backend, between processes.
//!
//! ## Features
//!
//! - Exclusive claim/reserve/release of pool slots: no index is ever handed
//!   out twice
//! - In-memory backend for single-node deployments
//! - SQLite-backed durable backend shared by several server instances
//! - Random or oldest-released allocation order
//! - Reconciliation of pool bindings against a lease cache
//!
//! ## Quick Start
//!
//! ```no_run
//! use dhcppool::{BackendRegistry, Config, MacAddr, PoolBackend};
//!
//! fn main() -> dhcppool::Result<()> {
//!     let config = Config::load_or_create("dhcppool.json")?;
//!     let pools = config.build_pools(&BackendRegistry::default())?;
//!
//!     let pool = pools.get("default")?;
//!     let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse()?;
//!     let binding = pool.allocate(mac)?;
//!     println!("{} got slot {}", mac, binding.index);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`PoolState`] - Free/reserved partition of one pool
//! - [`PoolBackend`] - Contract every storage backend implements
//! - [`MemoryPool`] - Process-local backend behind a mutex
//! - [`SqlPool`] - Durable backend over a shared [`SqlStore`]
//! - [`BackendRegistry`] - Backend key → constructor
//! - [`PoolRegistry`] - The pools a server owns
//! - [`reconcile()`] - Drift detection against a lease cache

pub mod backend;
pub mod config;
pub mod error;
pub mod factory;
pub mod mac;
pub mod memory;
pub mod pool;
pub mod reconcile;
pub mod sql;

pub use backend::PoolBackend;
pub use config::{Config, PoolConfig, StorageConfig};
pub use error::{Error, Result};
pub use factory::{BackendRegistry, MEMORY_BACKEND, PoolRegistry, SQLITE_BACKEND};
pub use mac::MacAddr;
pub use memory::MemoryPool;
pub use pool::{Algorithm, Binding, PoolSpec, PoolState, Slot};
pub use reconcile::{Reconciliation, reconcile};
pub use sql::{SqlPool, SqlStore};
