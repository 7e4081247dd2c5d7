use super::ReachabilityMarker;
use crate::{
    counters::PrunerCounters,
    errors::{PruneError, PruneResult},
    roots::ProtectedRootSet,
};
use rayon::prelude::*;
use serde::Serialize;
use std::{
    sync::atomic::Ordering,
    time::{Duration, Instant},
};
use vstate_core::{debug, info, warn};
use vstate_store::{NodeId, PrunableStore};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkStats {
    pub marked_count: u64,
    #[serde(serialize_with = "crate::report::serialize_secs")]
    pub duration: Duration,
    pub strategy_used: &'static str,
    pub traversal_errors: u64,
}

/// Marks every node reachable from `protected` into `marker`.
///
/// Traversal is breadth first, one level at a time. Child lookups of a level run on a pool of
/// `workers` threads while marking stays on the calling thread, so every node is visited once
/// and the resulting counts do not depend on scheduling. Unreadable nodes are counted in
/// `traversal_errors` and treated as leaves.
pub fn mark<S, F>(
    store: &S,
    protected: &ProtectedRootSet,
    marker: &ReachabilityMarker,
    workers: usize,
    counters: &PrunerCounters,
    should_stop: F,
) -> PruneResult<MarkStats>
where
    S: PrunableStore + ?Sized,
    F: Fn() -> bool,
{
    let start = Instant::now();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("mark-worker-{i}"))
        .build()
        .map_err(|err| PruneError::InvalidConfig(format!("cannot build mark worker pool: {err}")))?;

    let mut traversal_errors = 0u64;
    let mut frontier = marker.mark_level(protected.roots())?;
    counters.reachable_nodes_scanned.fetch_add(frontier.len() as u64, Ordering::Relaxed);
    let mut depth = 0;

    while !frontier.is_empty() {
        if should_stop() {
            return Err(PruneError::Cancelled);
        }
        let lookups: Vec<(NodeId, _)> = pool.install(|| frontier.par_iter().map(|&id| (id, store.children(id))).collect());

        let mut next = Vec::new();
        for (id, lookup) in lookups {
            match lookup {
                Ok(children) => next.extend(children),
                Err(err) => {
                    traversal_errors += 1;
                    warn!("{}", PruneError::TraversalFault { node: id, reason: err.to_string() });
                }
            }
        }

        frontier = marker.mark_level(next)?;
        counters.reachable_nodes_scanned.fetch_add(frontier.len() as u64, Ordering::Relaxed);
        depth += 1;
        debug!("Mark level {}: {} new nodes", depth, frontier.len());
    }

    let stats = MarkStats {
        marked_count: marker.marked_count(),
        duration: start.elapsed(),
        strategy_used: marker.strategy_name(),
        traversal_errors,
    };
    info!(
        "Marked {} reachable nodes from {} protected roots in {:.2}s using the {} strategy ({} traversal errors)",
        stats.marked_count,
        protected.len(),
        stats.duration.as_secs_f64(),
        stats.strategy_used,
        stats.traversal_errors
    );
    Ok(stats)
}
