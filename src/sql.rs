//! Durable pool backend on a shared SQL store.
//!
//! Each pool owns one row per index in the `dhcppool` table, keyed by
//! `(pool_name, idx)`. The table is the authority: every mutation is a single
//! conditional statement, so any number of connections (in any number of
//! processes) can share a pool without handing out an index twice.
//!
//! # Claiming
//!
//! [`SqlPool::allocate`](crate::PoolBackend::allocate) selects a free row,
//! marks it and returns its index in one `UPDATE … RETURNING` statement.
//! The store never sees a state where an index was picked but not yet marked.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql, TransactionBehavior, params};
use tracing::{debug, info, warn};

use crate::backend::PoolBackend;
use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::pool::{Algorithm, Binding, PoolSpec};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dhcppool (
    id          INTEGER PRIMARY KEY,
    pool_name   TEXT    NOT NULL,
    idx         INTEGER NOT NULL,
    free        INTEGER NOT NULL DEFAULT 1,
    mac         TEXT    NOT NULL DEFAULT '00:00:00:00:00:00',
    released_at INTEGER,
    UNIQUE (pool_name, idx)
);";

const INSERT_SLOT: &str = "INSERT INTO dhcppool (pool_name, idx) VALUES (?1, ?2) \
     ON CONFLICT (pool_name, idx) DO NOTHING";

const CLAIM_RANDOM: &str = "UPDATE dhcppool SET free = 0, mac = ?1 \
     WHERE id = (SELECT id FROM dhcppool \
                 WHERE pool_name = ?2 AND free = 1 AND idx < ?3 \
                 ORDER BY RANDOM() LIMIT 1) \
       AND free = 1 \
     RETURNING idx";

const CLAIM_OLDEST_RELEASED: &str = "UPDATE dhcppool SET free = 0, mac = ?1 \
     WHERE id = (SELECT id FROM dhcppool \
                 WHERE pool_name = ?2 AND free = 1 AND idx < ?3 \
                 ORDER BY released_at IS NOT NULL, released_at, idx LIMIT 1) \
       AND free = 1 \
     RETURNING idx";

const RESERVE: &str = "UPDATE dhcppool SET free = 0, mac = ?1 \
     WHERE pool_name = ?2 AND idx = ?3 AND free = 1";

const RELEASE: &str = "UPDATE dhcppool SET free = 1, mac = ?1, released_at = ?2 \
     WHERE pool_name = ?3 AND idx = ?4 AND free = 0";

const SELECT_SLOT: &str = "SELECT free, mac FROM dhcppool WHERE pool_name = ?1 AND idx = ?2";

const COUNT_FREE: &str =
    "SELECT COUNT(*) FROM dhcppool WHERE pool_name = ?1 AND free = 1 AND idx < ?2";

const SELECT_BINDINGS: &str = "SELECT idx, mac FROM dhcppool \
     WHERE pool_name = ?1 AND free = 0 AND idx < ?2 ORDER BY idx";

/// How many times a claim that matched no row is retried while the store
/// still reports free rows.
const CLAIM_ATTEMPTS: usize = 3;

/// Default time a statement waits for a lock held by another connection.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl ToSql for MacAddr {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for MacAddr {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}

/// Handle to the database holding the pool rows.
///
/// Cloning shares the underlying connection. Open one store per process (or
/// several, they coordinate through the database's own locking).
#[derive(Debug, Clone)]
pub struct SqlStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlStore {
    /// Opens (or creates) the database at `path` and ensures the schema.
    ///
    /// `busy_timeout` bounds how long a statement waits on another writer;
    /// on expiry the call fails with
    /// [`Error::BackendUnavailable`] and the pool is unchanged.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database. Nothing is shared or persisted.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pool backend persisted in a [`SqlStore`].
#[derive(Debug)]
pub struct SqlPool {
    name: String,
    capacity: u32,
    algorithm: Algorithm,
    store: SqlStore,
}

impl SqlPool {
    /// Creates the rows for `spec` in `store`, or attaches to them if they
    /// already exist. Existing rows keep their bindings.
    pub fn create(spec: PoolSpec, store: &SqlStore) -> Result<Self> {
        {
            let mut conn = store.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut inserted = 0;
            {
                let mut insert = tx.prepare(INSERT_SLOT)?;
                for index in 0..spec.capacity {
                    inserted += insert.execute(params![spec.name, index])?;
                }
            }
            tx.commit()?;

            info!(
                "Opened durable pool {} ({} addresses, {} new rows, {:?})",
                spec.name, spec.capacity, inserted, spec.algorithm
            );
        }

        Ok(Self {
            name: spec.name,
            capacity: spec.capacity,
            algorithm: spec.algorithm,
            store: store.clone(),
        })
    }

    fn claim_statement(&self) -> &'static str {
        match self.algorithm {
            Algorithm::Random => CLAIM_RANDOM,
            Algorithm::OldestReleased => CLAIM_OLDEST_RELEASED,
        }
    }

    fn count_free(&self, conn: &Connection) -> Result<u32> {
        let count = conn
            .prepare_cached(COUNT_FREE)?
            .query_row(params![self.name, self.capacity], |row| row.get(0))?;
        Ok(count)
    }
}

impl PoolBackend for SqlPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn reserve(&self, index: u32, mac: MacAddr) -> Result<MacAddr> {
        if !self.index_in_pool(index) {
            return Err(Error::OutOfRange(index));
        }
        mac.ensure_bindable()?;

        let conn = self.store.lock();
        let updated = conn
            .prepare_cached(RESERVE)?
            .execute(params![mac, self.name, index])?;

        if updated != 1 {
            return Err(Error::AlreadyReserved(index));
        }
        debug!("Pool {}: reserved {} for {}", self.name, index, mac);
        Ok(mac)
    }

    fn free(&self, index: u32) -> Result<()> {
        if !self.index_in_pool(index) {
            return Err(Error::OutOfRange(index));
        }

        let conn = self.store.lock();
        let released_at = Utc::now().timestamp_millis();
        let updated = conn.prepare_cached(RELEASE)?.execute(params![
            MacAddr::UNBOUND,
            released_at,
            self.name,
            index
        ])?;

        if updated != 1 {
            return Err(Error::AlreadyFree(index));
        }
        debug!("Pool {}: freed {}", self.name, index);
        Ok(())
    }

    fn is_free(&self, index: u32) -> Result<bool> {
        if !self.index_in_pool(index) {
            return Ok(false);
        }

        let conn = self.store.lock();
        let free: Option<bool> = conn
            .prepare_cached(SELECT_SLOT)?
            .query_row(params![self.name, index], |row| row.get(0))
            .optional()?;
        Ok(free.unwrap_or(false))
    }

    fn lookup(&self, index: u32) -> Result<MacAddr> {
        if !self.index_in_pool(index) {
            return Err(Error::IndexNotInPool(index));
        }

        let conn = self.store.lock();
        let slot: Option<(bool, MacAddr)> = conn
            .prepare_cached(SELECT_SLOT)?
            .query_row(params![self.name, index], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        match slot {
            Some((true, _)) => Ok(MacAddr::UNBOUND),
            Some((false, mac)) => Ok(mac),
            None => Err(Error::IndexNotInPool(index)),
        }
    }

    fn allocate(&self, mac: MacAddr) -> Result<Binding> {
        mac.ensure_bindable()?;

        let conn = self.store.lock();
        for attempt in 1..=CLAIM_ATTEMPTS {
            let claimed: Option<u32> = conn
                .prepare_cached(self.claim_statement())?
                .query_row(params![mac, self.name, self.capacity], |row| row.get(0))
                .optional()?;

            if let Some(index) = claimed {
                debug!("Pool {}: allocated {} to {}", self.name, index, mac);
                return Ok(Binding::new(index, mac));
            }

            // Nothing was claimed. Only a concurrent claimant can make this
            // happen while free rows remain.
            if self.count_free(&conn)? == 0 {
                break;
            }
            warn!(
                "Pool {}: claim for {} lost a race (attempt {}/{})",
                self.name, mac, attempt, CLAIM_ATTEMPTS
            );
        }

        warn!("Pool {} exhausted, cannot allocate for {}", self.name, mac);
        Err(Error::PoolExhausted)
    }

    fn remaining(&self) -> Result<u32> {
        let conn = self.store.lock();
        self.count_free(&conn)
    }

    fn bindings(&self) -> Result<Vec<Binding>> {
        let conn = self.store.lock();
        let mut statement = conn.prepare_cached(SELECT_BINDINGS)?;
        let rows = statement.query_map(params![self.name, self.capacity], |row| {
            Ok(Binding::new(row.get(0)?, row.get(1)?))
        })?;

        let mut bindings = Vec::new();
        for binding in rows {
            bindings.push(binding?);
        }
        Ok(bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn memory_pool(name: &str, capacity: u32) -> SqlPool {
        let store = SqlStore::open_in_memory().unwrap();
        SqlPool::create(PoolSpec::new(name, capacity), &store).unwrap()
    }

    fn row_count(store: &SqlStore, name: &str) -> u32 {
        store
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM dhcppool WHERE pool_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_capacity_three_scenario() {
        let pool = memory_pool("scenario", 3);

        let mut indices = HashSet::new();
        for n in 0..3 {
            let binding = pool.allocate(mac(n)).unwrap();
            assert!(indices.insert(binding.index));
            assert_eq!(pool.lookup(binding.index).unwrap(), mac(n));
        }
        assert_eq!(indices, HashSet::from([0, 1, 2]));
        assert!(matches!(pool.allocate(mac(3)), Err(Error::PoolExhausted)));
        assert!(matches!(pool.allocate(mac(4)), Err(Error::PoolExhausted)));

        pool.free(1).unwrap();
        assert_eq!(pool.allocate(mac(3)).unwrap().index, 1);
    }

    #[test]
    fn test_reserve_free_round_trip() {
        let pool = memory_pool("round_trip", 8);
        let before = pool.remaining().unwrap();

        assert_eq!(pool.reserve(5, mac(1)).unwrap(), mac(1));
        assert!(!pool.is_free(5).unwrap());
        assert_eq!(pool.remaining().unwrap(), before - 1);

        pool.free(5).unwrap();
        assert!(pool.is_free(5).unwrap());
        assert_eq!(pool.remaining().unwrap(), before);
        assert_eq!(pool.lookup(5).unwrap(), MacAddr::UNBOUND);
    }

    #[test]
    fn test_conditional_updates_report_domain_errors() {
        let pool = memory_pool("conditional", 2);
        pool.reserve(0, mac(1)).unwrap();
        assert!(matches!(
            pool.reserve(0, mac(2)),
            Err(Error::AlreadyReserved(0))
        ));
        assert_eq!(pool.lookup(0).unwrap(), mac(1));

        assert!(matches!(pool.free(1), Err(Error::AlreadyFree(1))));
    }

    #[test]
    fn test_invalid_index_mutates_nothing() {
        let pool = memory_pool("bounds", 4);
        assert!(matches!(pool.reserve(4, mac(1)), Err(Error::OutOfRange(4))));
        assert!(matches!(pool.free(7), Err(Error::OutOfRange(7))));
        assert!(matches!(pool.lookup(4), Err(Error::IndexNotInPool(4))));
        assert!(!pool.is_free(4).unwrap());
        assert_eq!(pool.remaining().unwrap(), 4);
        assert!(pool.bindings().unwrap().is_empty());
    }

    #[test]
    fn test_unbound_mac_rejected() {
        let pool = memory_pool("unbound", 2);
        assert!(matches!(
            pool.allocate(MacAddr::UNBOUND),
            Err(Error::InvalidMac(_))
        ));
        assert!(matches!(
            pool.reserve(0, MacAddr::UNBOUND),
            Err(Error::InvalidMac(_))
        ));
        assert_eq!(pool.remaining().unwrap(), 2);
    }

    #[test]
    fn test_recreate_is_idempotent() {
        let store = SqlStore::open_in_memory().unwrap();
        let first = SqlPool::create(PoolSpec::new("lan", 6), &store).unwrap();
        first.reserve(2, mac(2)).unwrap();

        let second = SqlPool::create(PoolSpec::new("lan", 6), &store).unwrap();
        assert_eq!(row_count(&store, "lan"), 6);
        assert_eq!(second.lookup(2).unwrap(), mac(2));
        assert_eq!(second.remaining().unwrap(), 5);
    }

    #[test]
    fn test_pools_are_namespaced() {
        let store = SqlStore::open_in_memory().unwrap();
        let lan = SqlPool::create(PoolSpec::new("lan", 2), &store).unwrap();
        let guest = SqlPool::create(PoolSpec::new("guest", 2), &store).unwrap();

        lan.reserve(0, mac(1)).unwrap();
        assert!(guest.is_free(0).unwrap());
        assert_eq!(guest.remaining().unwrap(), 2);
        assert_eq!(lan.remaining().unwrap(), 1);
    }

    #[test]
    fn test_oldest_released_claims() {
        let store = SqlStore::open_in_memory().unwrap();
        let spec = PoolSpec::new("oldest", 3).with_algorithm(Algorithm::OldestReleased);
        let pool = SqlPool::create(spec, &store).unwrap();

        for n in 0..3 {
            assert_eq!(pool.allocate(mac(n)).unwrap().index, n as u32);
        }

        pool.free(2).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        pool.free(0).unwrap();

        assert_eq!(pool.allocate(mac(7)).unwrap().index, 2);
        assert_eq!(pool.allocate(mac(8)).unwrap().index, 0);
    }

    #[test]
    fn test_bindings_and_reconcile() {
        let pool = memory_pool("drift", 4);
        pool.reserve(0, mac(0xa)).unwrap();
        pool.reserve(1, mac(0xb)).unwrap();
        pool.reserve(2, mac(0xa)).unwrap();

        assert_eq!(
            pool.bindings().unwrap(),
            vec![
                Binding::new(0, mac(0xa)),
                Binding::new(1, mac(0xb)),
                Binding::new(2, mac(0xa)),
            ]
        );

        let report = pool.reconcile(&HashSet::from([mac(0xa)])).unwrap();
        assert_eq!(report.orphaned, vec![Binding::new(1, mac(0xb))]);
        assert_eq!(
            report.duplicates.keys().copied().collect::<Vec<_>>(),
            vec![0, 2]
        );
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");

        let index = {
            let store = SqlStore::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
            let pool = SqlPool::create(PoolSpec::new("persist", 4), &store).unwrap();
            pool.allocate(mac(1)).unwrap().index
        };

        let store = SqlStore::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
        let pool = SqlPool::create(PoolSpec::new("persist", 4), &store).unwrap();
        assert_eq!(pool.lookup(index).unwrap(), mac(1));
        assert_eq!(pool.remaining().unwrap(), 3);
    }

    #[test]
    fn test_storage_failure_is_not_contention() {
        let store = SqlStore::open_in_memory().unwrap();
        let pool = SqlPool::create(PoolSpec::new("broken", 2), &store).unwrap();
        store.lock().execute_batch("DROP TABLE dhcppool").unwrap();

        assert!(matches!(
            pool.reserve(0, mac(1)),
            Err(Error::BackendUnavailable(_))
        ));
        assert!(matches!(pool.free(0), Err(Error::BackendUnavailable(_))));
        assert!(matches!(
            pool.allocate(mac(1)),
            Err(Error::BackendUnavailable(_))
        ));
        assert!(matches!(pool.is_free(0), Err(Error::BackendUnavailable(_))));
    }
}
