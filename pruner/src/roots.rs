use crate::errors::PruneResult;
use itertools::Itertools;
use vstate_store::{NodeId, PrunableStore};

/// The roots a pass must keep alive, derived fresh for every pass and never persisted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtectedRootSet {
    // Sorted by descending tx order, deduplicated
    roots: Vec<(u64, NodeId)>,
}

impl ProtectedRootSet {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// The newest root, always part of the set
    pub fn latest(&self) -> Option<(u64, NodeId)> {
        self.roots.first().copied()
    }

    /// The oldest protected tx order. Anything superseded strictly before it is fair game
    pub fn cutoff_order(&self) -> Option<u64> {
        self.roots.last().map(|&(order, _)| order)
    }

    pub fn roots(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.roots.iter().map(|&(_, root)| root)
    }

    pub fn entries(&self) -> &[(u64, NodeId)] {
        &self.roots
    }
}

/// Selects the `max(protection_orders, 1)` roots with the highest tx order.
///
/// A window of zero still protects the latest root.
pub fn protected_roots(all_roots: impl IntoIterator<Item = (u64, NodeId)>, protection_orders: u64) -> ProtectedRootSet {
    let window = protection_orders.max(1) as usize;
    let roots = all_roots.into_iter().sorted_unstable_by(|a, b| b.cmp(a)).dedup().take(window).collect();
    ProtectedRootSet { roots }
}

pub struct RootRegistry;

impl RootRegistry {
    /// Loads only the newest roots needed for the window
    pub fn load_protected<S: PrunableStore + ?Sized>(store: &S, protection_orders: u64) -> PruneResult<ProtectedRootSet> {
        let window = protection_orders.max(1).min(usize::MAX as u64) as usize;
        Ok(protected_roots(store.latest_roots(window)?, protection_orders))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vstate_hashes::Hash;

    fn roots(orders: &[u64]) -> Vec<(u64, NodeId)> {
        orders.iter().map(|&o| (o, Hash::from_u64_word(o))).collect()
    }

    #[test]
    fn test_window_selection() {
        let all = roots(&[3, 1, 7, 5, 9]);
        let set = protected_roots(all.clone(), 3);
        assert_eq!(set.len(), 3);
        assert_eq!(set.latest(), Some((9, Hash::from_u64_word(9))));
        assert_eq!(set.cutoff_order(), Some(5));

        // Aggressive mode still keeps the latest root
        let aggressive = protected_roots(all.clone(), 0);
        assert_eq!(aggressive.entries(), &[(9, Hash::from_u64_word(9))]);

        let everything = protected_roots(all, 100);
        assert_eq!(everything.len(), 5);
        assert_eq!(everything.cutoff_order(), Some(1));
    }

    #[test]
    fn test_duplicates_and_empty() {
        let mut all = roots(&[4, 4, 2]);
        all.push((4, Hash::from_u64_word(4)));
        let set = protected_roots(all, 2);
        assert_eq!(set.entries(), &roots(&[4, 2])[..]);
        assert!(protected_roots(Vec::new(), 5).is_empty());
        assert_eq!(protected_roots(Vec::new(), 5).cutoff_order(), None);
    }

    #[test]
    fn test_window_is_monotone() {
        let mut all = roots(&[1, 2, 3]);
        let before = protected_roots(all.clone(), 2);
        all.extend(roots(&[4]));
        let after = protected_roots(all, 2);
        assert!(after.cutoff_order() > before.cutoff_order());
        assert!(!after.roots().any(|r| r == Hash::from_u64_word(2)));
    }
}
