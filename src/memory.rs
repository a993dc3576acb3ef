//! Process-local pool backend.
//!
//! All state lives in a [`PoolState`] behind one [`Mutex`] per pool. Every
//! operation takes the lock for its whole duration, so a claim picks, removes
//! and binds an index without anyone observing the steps in between.
//!
//! State is lost on restart. Use [`SqlPool`](crate::SqlPool) when several
//! servers share a pool or bindings must survive a restart.

use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::backend::PoolBackend;
use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::pool::{Algorithm, Binding, PoolSpec, PoolState};

#[derive(Debug)]
struct Inner {
    pool: PoolState,
    rng: StdRng,
}

/// Thread-safe in-memory pool.
///
/// # Example
///
/// ```
/// use dhcppool::{MacAddr, MemoryPool, PoolBackend, PoolSpec};
///
/// # fn example() -> dhcppool::Result<()> {
/// let pool = MemoryPool::new(PoolSpec::new("lan", 16));
/// let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse()?;
///
/// let binding = pool.allocate(mac)?;
/// assert_eq!(pool.lookup(binding.index)?, mac);
/// pool.free(binding.index)?;
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
#[derive(Debug)]
pub struct MemoryPool {
    name: String,
    capacity: u32,
    algorithm: Algorithm,
    state: Mutex<Inner>,
}

impl MemoryPool {
    /// Creates a pool with every slot free.
    pub fn new(spec: PoolSpec) -> Self {
        Self::with_rng(spec, StdRng::from_os_rng())
    }

    /// Creates a pool whose random picks are reproducible.
    pub fn with_seed(spec: PoolSpec, seed: u64) -> Self {
        Self::with_rng(spec, StdRng::seed_from_u64(seed))
    }

    fn with_rng(spec: PoolSpec, rng: StdRng) -> Self {
        info!(
            "Created in-memory pool {} ({} addresses, {:?})",
            spec.name, spec.capacity, spec.algorithm
        );
        Self {
            capacity: spec.capacity,
            algorithm: spec.algorithm,
            state: Mutex::new(Inner {
                pool: PoolState::new(spec.capacity),
                rng,
            }),
            name: spec.name,
        }
    }

    // Mutations validate before applying, so a poisoned state is consistent.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PoolBackend for MemoryPool {
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
        let mut state = self.lock();
        let bound = state.pool.reserve(index, mac)?;
        debug!("Pool {}: reserved {} for {}", self.name, index, bound);
        Ok(bound)
    }

    fn free(&self, index: u32) -> Result<()> {
        let mut state = self.lock();
        state.pool.release(index)?;
        debug!("Pool {}: freed {}", self.name, index);
        Ok(())
    }

    fn is_free(&self, index: u32) -> Result<bool> {
        Ok(self.lock().pool.is_free(index))
    }

    fn lookup(&self, index: u32) -> Result<MacAddr> {
        self.lock().pool.lookup(index)
    }

    fn allocate(&self, mac: MacAddr) -> Result<Binding> {
        let mut state = self.lock();
        let Inner { pool, rng } = &mut *state;

        match pool.claim(mac, self.algorithm, rng) {
            Ok(binding) => {
                debug!(
                    "Pool {}: allocated {} to {}",
                    self.name, binding.index, binding.mac
                );
                Ok(binding)
            }
            Err(Error::PoolExhausted) => {
                warn!("Pool {} exhausted, cannot allocate for {}", self.name, mac);
                Err(Error::PoolExhausted)
            }
            Err(error) => Err(error),
        }
    }

    fn remaining(&self) -> Result<u32> {
        Ok(self.lock().pool.remaining())
    }

    fn bindings(&self) -> Result<Vec<Binding>> {
        Ok(self.lock().pool.bindings())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    #[test]
    fn test_capacity_three_scenario() {
        let pool = MemoryPool::with_seed(PoolSpec::new("scenario", 3), 11);

        let mut indices = HashSet::new();
        for n in 0..3 {
            let binding = pool.allocate(mac(n)).unwrap();
            assert!(indices.insert(binding.index));
            assert!(!pool.is_free(binding.index).unwrap());
        }
        assert_eq!(indices, HashSet::from([0, 1, 2]));

        assert!(matches!(pool.allocate(mac(3)), Err(Error::PoolExhausted)));

        pool.free(1).unwrap();
        let binding = pool.allocate(mac(3)).unwrap();
        assert_eq!(binding.index, 1);
        assert_eq!(pool.remaining().unwrap(), 0);
    }

    #[test]
    fn test_reserve_free_round_trip() {
        let pool = MemoryPool::new(PoolSpec::new("round_trip", 10));
        let before = pool.remaining().unwrap();

        assert_eq!(pool.reserve(4, mac(1)).unwrap(), mac(1));
        assert_eq!(pool.lookup(4).unwrap(), mac(1));
        assert_eq!(pool.remaining().unwrap(), before - 1);

        pool.free(4).unwrap();
        assert_eq!(pool.remaining().unwrap(), before);
        assert_eq!(pool.lookup(4).unwrap(), MacAddr::UNBOUND);
    }

    #[test]
    fn test_double_reserve_and_double_free() {
        let pool = MemoryPool::new(PoolSpec::new("double", 2));
        pool.reserve(0, mac(1)).unwrap();
        assert!(matches!(
            pool.reserve(0, mac(2)),
            Err(Error::AlreadyReserved(0))
        ));
        assert_eq!(pool.lookup(0).unwrap(), mac(1));

        pool.free(0).unwrap();
        assert!(matches!(pool.free(0), Err(Error::AlreadyFree(0))));
    }

    #[test]
    fn test_invalid_index_mutates_nothing() {
        let pool = MemoryPool::new(PoolSpec::new("bounds", 4));
        pool.reserve(1, mac(1)).unwrap();

        assert!(matches!(pool.reserve(4, mac(2)), Err(Error::OutOfRange(4))));
        assert!(matches!(pool.free(100), Err(Error::OutOfRange(100))));
        assert!(matches!(pool.lookup(4), Err(Error::IndexNotInPool(4))));
        assert!(!pool.is_free(4).unwrap());
        assert!(!pool.index_in_pool(4));

        assert_eq!(pool.remaining().unwrap(), 3);
        assert_eq!(pool.bindings().unwrap(), vec![Binding::new(1, mac(1))]);
    }

    #[test]
    fn test_reconcile_through_backend() {
        let pool = MemoryPool::new(PoolSpec::new("drift", 4));
        pool.reserve(0, mac(0xa)).unwrap();
        pool.reserve(1, mac(0xb)).unwrap();
        pool.reserve(2, mac(0xa)).unwrap();

        let report = pool.reconcile(&HashSet::from([mac(0xa)])).unwrap();
        assert_eq!(report.orphaned, vec![Binding::new(1, mac(0xb))]);
        assert_eq!(
            report.duplicates.keys().copied().collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(pool.remaining().unwrap(), 1);
    }

    #[test]
    fn test_oldest_released_pool() {
        let spec = PoolSpec::new("oldest", 2).with_algorithm(Algorithm::OldestReleased);
        let pool = MemoryPool::new(spec);
        assert_eq!(pool.algorithm(), Algorithm::OldestReleased);

        assert_eq!(pool.allocate(mac(1)).unwrap().index, 0);
        assert_eq!(pool.allocate(mac(2)).unwrap().index, 1);
        pool.free(1).unwrap();
        pool.free(0).unwrap();
        assert_eq!(pool.allocate(mac(3)).unwrap().index, 1);
    }

    #[test]
    fn test_concurrent_allocations_are_exclusive() {
        let pool = Arc::new(MemoryPool::new(PoolSpec::new("concurrent", 20)));

        let handles: Vec<_> = (0..32u8)
            .map(|n| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.allocate(mac(n)))
            })
            .collect();

        let mut allocated = HashSet::new();
        let mut exhausted = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(binding) => {
                    assert!(
                        allocated.insert(binding.index),
                        "Duplicate index allocated: {}",
                        binding.index
                    );
                }
                Err(Error::PoolExhausted) => exhausted += 1,
                Err(error) => panic!("unexpected error: {}", error),
            }
        }

        assert_eq!(allocated.len(), 20);
        assert_eq!(exhausted, 12);
        assert_eq!(pool.remaining().unwrap(), 0);
    }
}
