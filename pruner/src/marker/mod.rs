pub mod bloom;
pub mod reach_seen;
mod traversal;

pub use traversal::{mark, MarkStats};

use crate::{config::MarkerStrategy, errors::PruneResult};
use bloom::{AtomicBloomFilter, DEFAULT_FALSE_POSITIVE_RATE};
use parking_lot::RwLock;
use reach_seen::DbReachSeenStore;
use rocksdb::WriteBatch;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use vstate_database::prelude::DB;
use vstate_store::NodeId;

/// Node count assumed by `auto` when the store cannot estimate its size
pub const FALLBACK_NODE_ESTIMATE: u64 = 1_000_000;

/// Resolves `auto` into a concrete strategy. The result never changes during a pass.
pub fn resolve_strategy(strategy: MarkerStrategy, estimated_nodes: Option<u64>, memory_node_limit: u64) -> MarkerStrategy {
    match strategy {
        MarkerStrategy::Auto => {
            if estimated_nodes.unwrap_or(FALLBACK_NODE_ESTIMATE) <= memory_node_limit {
                MarkerStrategy::Memory
            } else {
                MarkerStrategy::Persistent
            }
        }
        concrete => concrete,
    }
}

pub struct ExactMarker {
    set: RwLock<HashSet<NodeId>>,
}

pub struct PersistentMarker {
    filter: AtomicBloomFilter,
    seen: DbReachSeenStore,
    marked: AtomicU64,
}

/// The set of nodes found reachable during one pass
pub enum ReachabilityMarker {
    Exact(ExactMarker),
    Persistent(PersistentMarker),
}

impl ReachabilityMarker {
    pub fn exact() -> Self {
        Self::Exact(ExactMarker { set: RwLock::new(HashSet::new()) })
    }

    /// A bloom-backed marker. The reach-seen set of any previous pass is discarded.
    pub fn persistent(db: Arc<DB>, filter: AtomicBloomFilter) -> PruneResult<Self> {
        let seen = DbReachSeenStore::new(db);
        seen.clear()?;
        Ok(Self::Persistent(PersistentMarker { filter, seen, marked: AtomicU64::new(0) }))
    }

    /// Builds the marker for an already resolved strategy, sizing the bloom filter
    /// for `estimated_nodes` at the default false-positive rate
    pub fn for_strategy(strategy: MarkerStrategy, estimated_nodes: Option<u64>, db: Arc<DB>) -> PruneResult<Self> {
        match strategy {
            MarkerStrategy::Memory => Ok(Self::exact()),
            MarkerStrategy::Persistent | MarkerStrategy::Auto => {
                let expected = estimated_nodes.unwrap_or(FALLBACK_NODE_ESTIMATE);
                Self::persistent(db, AtomicBloomFilter::with_capacity(expected, DEFAULT_FALSE_POSITIVE_RATE))
            }
        }
    }

    pub fn strategy(&self) -> MarkerStrategy {
        match self {
            Self::Exact(_) => MarkerStrategy::Memory,
            Self::Persistent(_) => MarkerStrategy::Persistent,
        }
    }

    /// Display name used in reports
    pub fn strategy_name(&self) -> &'static str {
        match self {
            Self::Exact(_) => "Memory",
            Self::Persistent(_) => "Persistent",
        }
    }

    /// Sweep-time membership. The persistent variant may answer `true` for unmarked nodes, never `false` for marked ones.
    pub fn contains(&self, id: &NodeId) -> bool {
        match self {
            Self::Exact(m) => m.set.read().contains(id),
            Self::Persistent(m) => m.filter.contains(id),
        }
    }

    /// Marks `ids` and returns the ones which were not marked before, deduplicated and in input order
    pub fn mark_level(&self, ids: impl IntoIterator<Item = NodeId>) -> PruneResult<Vec<NodeId>> {
        match self {
            Self::Exact(m) => {
                let mut set = m.set.write();
                Ok(ids.into_iter().filter(|id| set.insert(*id)).collect())
            }
            Self::Persistent(m) => {
                let mut level = HashSet::new();
                let mut fresh = Vec::new();
                let mut batch = WriteBatch::default();
                for id in ids {
                    if level.contains(&id) {
                        continue;
                    }
                    // A bloom miss proves the node is new, a hit must be confirmed on disk
                    if m.filter.insert(&id) && m.seen.has(id)? {
                        continue;
                    }
                    m.seen.insert_batch(&mut batch, id)?;
                    level.insert(id);
                    fresh.push(id);
                }
                if !fresh.is_empty() {
                    m.seen.write(batch)?;
                    m.marked.fetch_add(fresh.len() as u64, Ordering::Relaxed);
                }
                Ok(fresh)
            }
        }
    }

    pub fn marked_count(&self) -> u64 {
        match self {
            Self::Exact(m) => m.set.read().len() as u64,
            Self::Persistent(m) => m.marked.load(Ordering::Relaxed),
        }
    }

    /// Memory held by the membership structure
    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Exact(m) => (m.set.read().capacity() * size_of::<NodeId>()) as u64,
            Self::Persistent(m) => m.filter.size_bytes(),
        }
    }

    /// Drops the on-disk reach-seen set left behind by a persistent pass
    pub fn release(self) -> PruneResult<()> {
        match self {
            Self::Exact(_) => Ok(()),
            Self::Persistent(m) => Ok(m.seen.clear()?),
        }
    }

    pub fn estimated_fp_rate(&self) -> f64 {
        match self {
            Self::Exact(_) => 0.0,
            Self::Persistent(m) => m.filter.estimated_fp_rate(m.marked.load(Ordering::Relaxed)),
        }
    }
}
