//! Drift detection between a pool and the caller's lease cache.
//!
//! The pool and the DHCP handler's own lease cache are written at different
//! moments (e.g. the ack goes out, then the cache write fails). [`reconcile`]
//! compares the two and reports what disagrees. It never repairs anything.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::mac::MacAddr;
use crate::pool::Binding;

/// Findings of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// Bindings whose MAC is not in the known set, in index order.
    pub orphaned: Vec<Binding>,
    /// Every index of every MAC that is bound more than once.
    pub duplicates: BTreeMap<u32, MacAddr>,
}

impl Reconciliation {
    /// Returns true if the pool agrees with the known set.
    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty() && self.duplicates.is_empty()
    }
}

/// Cross-checks `bindings` against the MACs the caller considers in use.
///
/// Each binding is judged on its own. Placeholder bindings are bookkeeping
/// and never reported.
pub fn reconcile<I>(bindings: I, known: &HashSet<MacAddr>) -> Reconciliation
where
    I: IntoIterator<Item = Binding>,
{
    let mut bindings: Vec<Binding> = bindings
        .into_iter()
        .filter(|binding| !binding.mac.is_placeholder() && !binding.mac.is_unbound())
        .collect();
    bindings.sort_by_key(|binding| binding.index);

    let orphaned = bindings
        .iter()
        .filter(|binding| !known.contains(&binding.mac))
        .copied()
        .collect();

    let mut by_mac: HashMap<MacAddr, Vec<u32>> = HashMap::new();
    for binding in &bindings {
        by_mac.entry(binding.mac).or_default().push(binding.index);
    }

    let duplicates = by_mac
        .into_iter()
        .filter(|(_, indices)| indices.len() > 1)
        .flat_map(|(mac, indices)| indices.into_iter().map(move |index| (index, mac)))
        .collect();

    Reconciliation {
        orphaned,
        duplicates,
    }
}
