use crate::{
    counters::PrunerCounters,
    errors::{PruneError, PruneResult},
    marker::ReachabilityMarker,
    recycle_bin::{DiskSpaceGuard, RecycleBinStore, RecycleRecord},
};
use rayon::prelude::*;
use rocksdb::WriteBatch;
use serde::Serialize;
use std::{
    collections::HashSet,
    sync::atomic::Ordering,
    time::{Duration, Instant},
};
use vstate_core::{
    debug, info,
    time::{unix_now, Stopwatch},
    warn,
};
use vstate_database::prelude::{StoreResult, StoreResultExt};
use vstate_store::{NodeId, PrunableStore, StaleEntry};

/// The error ratio is only enforced once this many batches have completed
pub const MIN_BATCHES_FOR_ABORT: u64 = 10;

#[derive(Clone, Debug)]
pub struct SweepOptions {
    pub dry_run: bool,
    pub batch_size: usize,
    pub workers: usize,
    pub use_recycle_bin: bool,
    pub max_error_ratio: f64,
    /// Stamped on recycle records
    pub cutoff_order: u64,
    /// Consulted before recycle records are staged
    pub disk_guard: Option<DiskSpaceGuard>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepStats {
    pub scanned_count: u64,
    pub kept_count: u64,
    pub deleted_count: u64,
    pub recycle_bin_entries: u64,
    pub bytes_reclaimed: u64,
    pub failed_batches: u64,
    pub error_count: u64,
    pub aborted: bool,
    #[serde(serialize_with = "crate::report::serialize_secs")]
    pub duration: Duration,
}

impl SweepStats {
    pub fn is_clean(&self) -> bool {
        self.failed_batches == 0 && self.error_count == 0 && !self.aborted
    }

    fn absorb(&mut self, batch: BatchOutcome) {
        self.scanned_count += batch.scanned;
        self.kept_count += batch.kept;
        self.deleted_count += batch.deleted;
        self.recycle_bin_entries += batch.recycled;
        self.bytes_reclaimed += batch.bytes;
    }
}

#[derive(Default)]
struct BatchOutcome {
    scanned: u64,
    kept: u64,
    deleted: u64,
    recycled: u64,
    bytes: u64,
}

fn build_pool(workers: usize) -> PruneResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("sweep-worker-{i}"))
        .build()
        .map_err(|err| PruneError::InvalidConfig(format!("cannot build sweep worker pool: {err}")))
}

/// Deletes `doomed` in `batch`, staging recycle records first when a bin is given.
/// Nodes which are already gone are skipped.
fn stage_deletions<S: PrunableStore + ?Sized>(
    store: &S,
    batch: &mut WriteBatch,
    doomed: &[NodeId],
    recycle_bin: Option<&RecycleBinStore>,
    cutoff_order: u64,
    now: u64,
) -> StoreResult<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    let mut present = Vec::with_capacity(doomed.len());
    for &id in doomed {
        match recycle_bin {
            Some(bin) => {
                let Some(bytes) = store.node_bytes(id).optional()? else { continue };
                outcome.bytes += bytes.len() as u64;
                bin.put_batch(batch, id, RecycleRecord::new(bytes, now, cutoff_order))?;
                outcome.recycled += 1;
            }
            None => {
                let Some(size) = store.node_size(id).optional()? else { continue };
                outcome.bytes += size;
            }
        }
        present.push(id);
    }
    store.delete_nodes_batch(batch, &present)?;
    outcome.deleted = present.len() as u64;
    Ok(outcome)
}

fn sweep_batch<S: PrunableStore + ?Sized>(
    store: &S,
    marker: &ReachabilityMarker,
    ids: &[NodeId],
    options: &SweepOptions,
    recycle_bin: Option<&RecycleBinStore>,
    now: u64,
) -> StoreResult<BatchOutcome> {
    let _swo = Stopwatch::<500>::with_threshold("sweep-batch");
    let (kept, doomed): (Vec<NodeId>, Vec<NodeId>) = ids.iter().partition(|id| marker.contains(id));

    if options.dry_run {
        let mut outcome = BatchOutcome { deleted: doomed.len() as u64, ..Default::default() };
        for &id in doomed.iter() {
            outcome.bytes += store.node_size(id).optional()?.unwrap_or_default();
        }
        if options.use_recycle_bin {
            outcome.recycled = outcome.deleted;
        }
        outcome.scanned = ids.len() as u64;
        outcome.kept = kept.len() as u64;
        return Ok(outcome);
    }

    let mut batch = WriteBatch::default();
    let mut outcome = stage_deletions(store, &mut batch, &doomed, recycle_bin, options.cutoff_order, now)?;
    if outcome.deleted > 0 {
        store.write_batch(batch)?;
    }
    outcome.scanned = ids.len() as u64;
    outcome.kept = kept.len() as u64;
    Ok(outcome)
}

/// Scans the whole node store and removes every node the marker does not contain.
///
/// Batches run in waves of `options.workers`. A failed batch is isolated and counted while its
/// siblings proceed. The pass aborts once the failure ratio exceeds `max_error_ratio`, when the
/// node iterator itself fails, or when `should_stop` fires between waves.
pub fn sweep<S, F>(
    store: &S,
    marker: &ReachabilityMarker,
    options: &SweepOptions,
    counters: &PrunerCounters,
    should_stop: F,
) -> PruneResult<SweepStats>
where
    S: PrunableStore + ?Sized,
    F: Fn() -> bool,
{
    let start = Instant::now();
    let pool = build_pool(options.workers)?;
    let recycle_bin = (options.use_recycle_bin && !options.dry_run).then(|| RecycleBinStore::new(store.db().clone()));
    let disk_guard = options.disk_guard.as_ref().filter(|_| recycle_bin.is_some());
    if let Some(guard) = disk_guard {
        guard.check()?;
    }
    let now = unix_now();

    let mut stats = SweepStats::default();
    let mut cursor: Option<NodeId> = None;
    let mut next_batch = 0u64;
    let mut processed = 0u64;
    let mut exhausted = false;

    while !exhausted {
        if should_stop() {
            info!("Sweep interrupted after {} batches", processed);
            stats.aborted = true;
            break;
        }
        if let Some(Err(err)) = disk_guard.map(|guard| guard.check()) {
            warn!("Sweep aborted after {} batches: {}", processed, err);
            stats.error_count += 1;
            stats.aborted = true;
            break;
        }

        let mut wave = Vec::with_capacity(options.workers);
        while wave.len() < options.workers.max(1) {
            match store.node_ids_after(cursor, options.batch_size) {
                Ok(ids) => {
                    exhausted = ids.len() < options.batch_size;
                    if let Some(&last) = ids.last() {
                        cursor = Some(last);
                        wave.push((next_batch, ids));
                        next_batch += 1;
                    }
                    if exhausted {
                        break;
                    }
                }
                Err(err) => {
                    warn!("Sweep aborted, node iteration failed: {}", err);
                    stats.error_count += 1;
                    stats.aborted = true;
                    exhausted = true;
                    break;
                }
            }
        }
        if wave.is_empty() {
            break;
        }

        let outcomes: Vec<_> = pool.install(|| {
            wave.into_par_iter()
                .map(|(index, ids)| {
                    sweep_batch(store, marker, &ids, options, recycle_bin.as_ref(), now)
                        .map_err(|err| PruneError::BatchWorkerFault { batch: index, reason: err.to_string() })
                })
                .collect()
        });

        for outcome in outcomes {
            processed += 1;
            match outcome {
                Ok(batch) => {
                    if !options.dry_run {
                        counters.disk_space_reclaimed_bytes.fetch_add(batch.bytes, Ordering::Relaxed);
                    }
                    stats.absorb(batch);
                }
                Err(err) => {
                    warn!("{}", err);
                    stats.failed_batches += 1;
                    stats.error_count += 1;
                }
            }
        }
        debug!("Swept {} batches, {} nodes deleted so far", processed, stats.deleted_count);

        if processed >= MIN_BATCHES_FOR_ABORT && stats.failed_batches as f64 / processed as f64 > options.max_error_ratio {
            warn!("{}", PruneError::SweepAborted { failed: stats.failed_batches, processed });
            stats.aborted = true;
            break;
        }
    }

    stats.duration = start.elapsed();
    info!(
        "Sweep {}: scanned {}, kept {}, deleted {}, recycled {}, {} bytes reclaimed in {:.2}s",
        if options.dry_run { "(dry run)" } else { "done" },
        stats.scanned_count,
        stats.kept_count,
        stats.deleted_count,
        stats.recycle_bin_entries,
        stats.bytes_reclaimed,
        stats.duration.as_secs_f64()
    );
    Ok(stats)
}

#[derive(Clone, Debug)]
pub struct StaleSweepOptions {
    pub scan_batch: usize,
    pub delete_batch: usize,
    pub use_recycle_bin: bool,
    pub max_error_ratio: f64,
    pub disk_guard: Option<DiskSpaceGuard>,
}

/// Stages the deletion of every unmarked node of `chunk` together with all of its index entries
fn sweep_stale_chunk<S: PrunableStore + ?Sized>(
    store: &S,
    marker: &ReachabilityMarker,
    chunk: &[StaleEntry],
    recycle_bin: Option<&RecycleBinStore>,
    cutoff_order: u64,
    now: u64,
) -> StoreResult<BatchOutcome> {
    let _swo = Stopwatch::<500>::with_threshold("stale-sweep-batch");
    let mut doomed = Vec::new();
    let mut seen = HashSet::with_capacity(chunk.len());
    let mut processed = Vec::new();
    let mut kept = 0u64;
    for entry in chunk {
        if marker.contains(&entry.node) {
            kept += 1;
            continue;
        }
        if seen.insert(entry.node) {
            doomed.push(entry.node);
        }
        processed.push(*entry);
    }

    let mut batch = WriteBatch::default();
    let outcome = stage_deletions(store, &mut batch, &doomed, recycle_bin, cutoff_order, now)?;
    store.delete_stale_batch(&mut batch, &processed)?;
    store.write_batch(batch)?;
    Ok(BatchOutcome { scanned: chunk.len() as u64, kept, ..outcome })
}

/// Sweeps only nodes recorded stale by commits in `from_order..cutoff_order`.
///
/// Stale nodes the marker still reaches are kept together with their index entries, so a node
/// retained by a bloom false positive is reconsidered by the next sweep starting at or below its
/// order. The entries of deleted nodes are removed in the same batch as the nodes. A failed batch
/// is counted and skipped, leaving its entries for a later sweep. The sweep is abandoned once the
/// failure ratio exceeds `max_error_ratio`, when free disk space runs out for recycle records, or
/// when `should_stop` fires between batches.
pub fn sweep_stale<S, F>(
    store: &S,
    marker: &ReachabilityMarker,
    cutoff_order: u64,
    from_order: u64,
    options: &StaleSweepOptions,
    should_stop: F,
) -> PruneResult<SweepStats>
where
    S: PrunableStore + ?Sized,
    F: Fn() -> bool,
{
    let start = Instant::now();
    let recycle_bin = options.use_recycle_bin.then(|| RecycleBinStore::new(store.db().clone()));
    let disk_guard = options.disk_guard.as_ref().filter(|_| recycle_bin.is_some());
    let scan_batch = options.scan_batch.max(1);
    let now = unix_now();
    let mut stats = SweepStats::default();
    let mut processed = 0u64;

    let mut entries = store.stale_before(from_order, cutoff_order, scan_batch)?;
    while let Some(&last) = entries.last() {
        for chunk in entries.chunks(options.delete_batch.max(1)) {
            if should_stop() {
                return Err(PruneError::Cancelled);
            }
            if let Some(guard) = disk_guard {
                guard.check()?;
            }
            processed += 1;
            match sweep_stale_chunk(store, marker, chunk, recycle_bin.as_ref(), cutoff_order, now) {
                Ok(outcome) => stats.absorb(outcome),
                Err(err) => {
                    warn!("{}", PruneError::BatchWorkerFault { batch: processed - 1, reason: err.to_string() });
                    stats.scanned_count += chunk.len() as u64;
                    stats.failed_batches += 1;
                    stats.error_count += 1;
                }
            }
            if processed >= MIN_BATCHES_FOR_ABORT && stats.failed_batches as f64 / processed as f64 > options.max_error_ratio {
                return Err(PruneError::SweepAborted { failed: stats.failed_batches, processed });
            }
        }
        entries = store.stale_after(last, cutoff_order, scan_batch)?;
    }

    stats.duration = start.elapsed();
    debug!(
        "Stale sweep below order {}: scanned {}, kept {}, deleted {}, {} failed batches in {:.2}s",
        cutoff_order,
        stats.scanned_count,
        stats.kept_count,
        stats.deleted_count,
        stats.failed_batches,
        stats.duration.as_secs_f64()
    );
    Ok(stats)
}
