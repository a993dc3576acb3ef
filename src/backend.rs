//! The storage contract every pool backend satisfies.

use std::collections::HashSet;
use std::fmt::Debug;

use crate::error::Result;
use crate::mac::MacAddr;
use crate::pool::{Algorithm, Binding};
use crate::reconcile::{Reconciliation, reconcile};

/// A named, fixed-capacity address pool.
///
/// Implementations must make [`allocate`](PoolBackend::allocate),
/// [`reserve`](PoolBackend::reserve) and [`free`](PoolBackend::free)
/// exclusive: two callers can never both obtain the same index, and a call
/// that fails leaves the pool exactly as it was.
///
/// All calls block until the backend has answered.
pub trait PoolBackend: Send + Sync + Debug {
    /// Name of the pool (the namespace in shared storage).
    fn name(&self) -> &str;

    /// Number of slots, fixed at creation.
    fn capacity(&self) -> u32;

    fn algorithm(&self) -> Algorithm;

    /// Binds `index` to `mac`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`](crate::Error::OutOfRange) if `index` is not in
    /// the pool, [`Error::AlreadyReserved`](crate::Error::AlreadyReserved) if
    /// the slot is taken.
    fn reserve(&self, index: u32, mac: MacAddr) -> Result<MacAddr>;

    /// Releases `index`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`](crate::Error::OutOfRange) if `index` is not in
    /// the pool, [`Error::AlreadyFree`](crate::Error::AlreadyFree) if the slot
    /// is not reserved.
    fn free(&self, index: u32) -> Result<()>;

    /// Returns `Ok(false)` for indices outside the pool.
    fn is_free(&self, index: u32) -> Result<bool>;

    /// Bound MAC, or [`MacAddr::UNBOUND`] if the slot is free.
    ///
    /// # Errors
    ///
    /// [`Error::IndexNotInPool`](crate::Error::IndexNotInPool) if `index` is
    /// not in the pool.
    fn lookup(&self, index: u32) -> Result<MacAddr>;

    /// Atomically claims a free index chosen by the pool's [`Algorithm`] and
    /// binds it to `mac`.
    ///
    /// # Errors
    ///
    /// [`Error::PoolExhausted`](crate::Error::PoolExhausted) if no index is
    /// free when the claim executes.
    fn allocate(&self, mac: MacAddr) -> Result<Binding>;

    /// Number of free slots.
    fn remaining(&self) -> Result<u32>;

    /// All current bindings, ordered by index.
    fn bindings(&self) -> Result<Vec<Binding>>;

    fn index_in_pool(&self, index: u32) -> bool {
        index < self.capacity()
    }

    /// Compares the pool's bindings against the MACs the caller knows about.
    ///
    /// Only fails if the bindings cannot be read; drift is returned as data.
    fn reconcile(&self, known: &HashSet<MacAddr>) -> Result<Reconciliation> {
        let report = reconcile(self.bindings()?, known);
        if !report.is_clean() {
            tracing::warn!(
                "Pool {} drifted from lease cache: {} orphaned, {} duplicated",
                self.name(),
                report.orphaned.len(),
                report.duplicates.len()
            );
        }
        Ok(report)
    }
}
