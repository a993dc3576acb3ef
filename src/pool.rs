//! The state of one address pool.
//!
//! A pool of capacity `C` owns the slot indices `0..C`. Every index is either
//! free or reserved for exactly one MAC address. [`PoolState`] keeps that
//! partition without any locking; a backend owns it and decides how access is
//! serialized.
//!
//! # Allocation
//!
//! The free indices live in a dense vector with a position table beside it,
//! so taking a specific index, returning one and picking a uniformly random
//! one are all O(1).

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mac::MacAddr;

/// How a pool picks the index handed out by an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Uniformly random over the currently free indices.
    #[default]
    Random,
    /// The free index released longest ago. Never-released indices come
    /// first, lowest index wins ties.
    OldestReleased,
}

/// What a backend needs to know to create a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    pub name: String,
    pub capacity: u32,
    pub algorithm: Algorithm,
}

impl PoolSpec {
    pub fn new(name: impl Into<String>, capacity: u32) -> Self {
        Self {
            name: name.into(),
            capacity,
            algorithm: Algorithm::default(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }
}

/// The state of a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Free,
    Reserved(MacAddr),
}

/// A reserved index and the MAC address it is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub index: u32,
    pub mac: MacAddr,
}

impl Binding {
    pub fn new(index: u32, mac: MacAddr) -> Self {
        Self { index, mac }
    }
}

/// Position marker for an index that is not in the free list. Positions are
/// below `capacity`, so they never reach it.
const RESERVED: u32 = u32::MAX;

/// Free/reserved partition of `0..capacity` plus the index → MAC bindings.
#[derive(Debug, Clone)]
pub struct PoolState {
    capacity: u32,
    /// Free indices, unordered.
    free: Vec<u32>,
    /// For each index, its position in `free`, or `RESERVED` if reserved.
    position: Vec<u32>,
    bindings: HashMap<u32, MacAddr>,
    /// Release sequence number per index; 0 means never released.
    released: Vec<u64>,
    release_seq: u64,
}

impl PoolState {
    /// Creates a pool with every index free.
    pub fn new(capacity: u32) -> Self {
        let size = capacity as usize;
        Self {
            capacity,
            free: (0..capacity).collect(),
            position: (0..capacity).collect(),
            bindings: HashMap::new(),
            released: vec![0; size],
            release_seq: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of free indices.
    pub fn remaining(&self) -> u32 {
        self.free.len() as u32
    }

    pub fn contains(&self, index: u32) -> bool {
        index < self.capacity
    }

    /// Returns false for indices outside the pool.
    pub fn is_free(&self, index: u32) -> bool {
        self.position
            .get(index as usize)
            .is_some_and(|&position| position != RESERVED)
    }

    /// Returns `None` for indices outside the pool.
    pub fn slot(&self, index: u32) -> Option<Slot> {
        if !self.contains(index) {
            return None;
        }
        Some(match self.bindings.get(&index) {
            Some(&mac) => Slot::Reserved(mac),
            None => Slot::Free,
        })
    }

    /// Bound MAC, or [`MacAddr::UNBOUND`] for a free slot.
    pub fn lookup(&self, index: u32) -> Result<MacAddr> {
        match self.slot(index) {
            Some(Slot::Reserved(mac)) => Ok(mac),
            Some(Slot::Free) => Ok(MacAddr::UNBOUND),
            None => Err(Error::IndexNotInPool(index)),
        }
    }

    /// Binds a specific free index to `mac`.
    pub fn reserve(&mut self, index: u32, mac: MacAddr) -> Result<MacAddr> {
        if !self.contains(index) {
            return Err(Error::OutOfRange(index));
        }
        mac.ensure_bindable()?;
        if !self.is_free(index) {
            return Err(Error::AlreadyReserved(index));
        }

        self.take(index);
        self.bindings.insert(index, mac);
        Ok(mac)
    }

    /// Drops the binding of a reserved index.
    pub fn release(&mut self, index: u32) -> Result<()> {
        if !self.contains(index) {
            return Err(Error::OutOfRange(index));
        }
        if self.is_free(index) {
            return Err(Error::AlreadyFree(index));
        }

        self.bindings.remove(&index);
        self.position[index as usize] = self.free.len() as u32;
        self.free.push(index);
        self.release_seq += 1;
        self.released[index as usize] = self.release_seq;
        Ok(())
    }

    /// Picks a free index with `algorithm` and binds it to `mac`.
    pub fn claim<R: Rng>(
        &mut self,
        mac: MacAddr,
        algorithm: Algorithm,
        rng: &mut R,
    ) -> Result<Binding> {
        mac.ensure_bindable()?;
        if self.free.is_empty() {
            return Err(Error::PoolExhausted);
        }

        let index = match algorithm {
            Algorithm::Random => self.free[rng.random_range(0..self.free.len())],
            Algorithm::OldestReleased => self
                .free
                .iter()
                .copied()
                .min_by_key(|&index| (self.released[index as usize], index))
                .ok_or(Error::PoolExhausted)?,
        };

        self.take(index);
        self.bindings.insert(index, mac);
        Ok(Binding::new(index, mac))
    }

    /// All current bindings, ordered by index.
    pub fn bindings(&self) -> Vec<Binding> {
        let mut bindings: Vec<Binding> = self
            .bindings
            .iter()
            .map(|(&index, &mac)| Binding::new(index, mac))
            .collect();
        bindings.sort_by_key(|binding| binding.index);
        bindings
    }

    /// Removes a free index from the free list. The caller has checked that
    /// `index` is free.
    fn take(&mut self, index: u32) {
        let position = std::mem::replace(&mut self.position[index as usize], RESERVED);
        if position == RESERVED {
            return;
        }
        self.free.swap_remove(position as usize);
        if let Some(&moved) = self.free.get(position as usize) {
            self.position[moved as usize] = position;
        }
    }
}
