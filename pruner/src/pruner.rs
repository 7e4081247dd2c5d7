use crate::{
    config::PrunerConfig,
    counters::{PrunerCounters, PrunerPhase},
    errors::{PruneError, PruneResult},
    marker::{bloom::AtomicBloomFilter, mark, ReachabilityMarker, FALLBACK_NODE_ESTIMATE},
    meta::{DbPrunerMetaStore, PrunerMeta},
    recycle_bin::{DiskSpaceGuard, RecycleBinStore},
    roots::{ProtectedRootSet, RootRegistry},
    sweeper::{sweep_stale, StaleSweepOptions, SweepStats},
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use vstate_core::{
    debug, info,
    task::{
        service::{AsyncService, AsyncServiceFuture},
        tick::{TickReason, TickService},
    },
    time::unix_now,
    trace, warn,
};
use vstate_store::PrunableStore;

const PRUNER: &str = "state-pruner";

/// What a completed cycle did
#[derive(Clone, Debug)]
pub struct CycleOutcome {
    pub full_sweep: bool,
    pub cutoff_order: u64,
    pub sweep: SweepStats,
    pub recycle_bin_purged: u64,
}

/// Background service deleting expired stale nodes while the node keeps committing.
///
/// Each cycle marks the protected window into a bloom-backed marker and sweeps the stale index
/// below the window's cutoff, either entirely or from the watermark left by the last successful
/// cycle. Cycles run on blocking threads and observe shutdown at batch boundaries.
pub struct StatePruner<S: PrunableStore + ?Sized + 'static> {
    store: Arc<S>,
    config: PrunerConfig,
    counters: Arc<PrunerCounters>,
    tick_service: Arc<TickService>,
    meta: Mutex<DbPrunerMetaStore>,
    cycles: AtomicU64,
}

impl<S: PrunableStore + ?Sized + 'static> StatePruner<S> {
    pub fn counters(&self) -> &Arc<PrunerCounters> {
        &self.counters
    }

    pub fn config(&self) -> &PrunerConfig {
        &self.config
    }

    fn is_full_sweep(&self, cycle: u64) -> bool {
        cycle == 0
            || !self.config.enable_incremental_sweep
            || (self.config.full_sweep_every > 0 && cycle % self.config.full_sweep_every == 0)
    }

    fn cycle(&self) -> PruneResult<CycleOutcome> {
        let started_at = unix_now();
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed);
        let meta = self.meta.lock().get()?.unwrap_or_default();

        self.counters.set_phase(PrunerPhase::Marking);
        let protected = RootRegistry::load_protected(self.store.as_ref(), self.config.protection_orders)?;
        let Some(cutoff_order) = protected.cutoff_order() else {
            debug!("[{}] no committed roots yet", PRUNER);
            return Ok(CycleOutcome { full_sweep: false, cutoff_order: 0, sweep: SweepStats::default(), recycle_bin_purged: 0 });
        };

        let expected = self.store.estimated_node_count().unwrap_or(FALLBACK_NODE_ESTIMATE);
        let filter = AtomicBloomFilter::with_bits(self.config.bloom_bits, expected);
        let marker = ReachabilityMarker::persistent(self.store.db().clone(), filter)?;
        self.counters.bloom_filter_size_bytes.store(marker.size_bytes(), Ordering::Relaxed);

        let full_sweep = self.is_full_sweep(cycle);
        let from_order = if full_sweep { 0 } else { meta.cutoff_watermark };
        let swept = self.mark_and_sweep(&protected, &marker, cutoff_order, from_order, full_sweep);
        let released = marker.release();
        let sweep = swept?;
        released?;

        let deleted = if full_sweep { &self.counters.sweep_expired_deleted } else { &self.counters.incremental_sweep_deleted };
        deleted.fetch_add(sweep.deleted_count, Ordering::Relaxed);
        self.counters.disk_space_reclaimed_bytes.fetch_add(sweep.bytes_reclaimed, Ordering::Relaxed);
        self.counters.error_count.fetch_add(sweep.error_count, Ordering::Relaxed);

        // Records written by this cycle are never older than its start
        let mut recycle_bin_purged = 0;
        if self.config.recycle_bin.auto_purge {
            recycle_bin_purged =
                RecycleBinStore::new(self.store.db().clone()).purge_expired(self.config.recycle_bin.grace_period_secs, started_at)?;
            self.counters.recycle_bin_purged.fetch_add(recycle_bin_purged, Ordering::Relaxed);
        }

        self.meta.lock().set(PrunerMeta {
            cutoff_watermark: cutoff_order.max(meta.cutoff_watermark),
            completed_cycles: meta.completed_cycles + 1,
            last_cycle_at: started_at,
        })?;
        self.counters.cycles_completed.fetch_add(1, Ordering::Relaxed);
        Ok(CycleOutcome { full_sweep, cutoff_order, sweep, recycle_bin_purged })
    }

    fn mark_and_sweep(
        &self,
        protected: &ProtectedRootSet,
        marker: &ReachabilityMarker,
        cutoff_order: u64,
        from_order: u64,
        full_sweep: bool,
    ) -> PruneResult<SweepStats> {
        let should_stop = || self.tick_service.is_shutdown();
        mark(self.store.as_ref(), protected, marker, self.config.workers, &self.counters, should_stop)?;

        self.counters.set_phase(if full_sweep { PrunerPhase::SweepingExpired } else { PrunerPhase::IncrementalSweeping });
        let options = StaleSweepOptions {
            scan_batch: self.config.scan_batch,
            delete_batch: self.config.delete_batch,
            use_recycle_bin: self.config.use_recycle_bin,
            max_error_ratio: self.config.max_error_ratio,
            disk_guard: DiskSpaceGuard::for_db(self.config.recycle_bin.disk_space, self.store.db()),
        };
        sweep_stale(self.store.as_ref(), marker, cutoff_order, from_order, &options, should_stop)
    }

    /// Runs one cycle. A failed cycle is counted and abandoned without moving the watermark.
    /// Batches which failed inside a completed sweep keep their stale entries for the next full sweep.
    pub fn run_cycle(&self) -> PruneResult<CycleOutcome> {
        let result = self.cycle();
        match &result {
            Ok(_) | Err(PruneError::Cancelled) => {}
            Err(err) => {
                self.counters.error_count.fetch_add(1, Ordering::Relaxed);
                self.counters.cycles_abandoned.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] cycle abandoned: {}", PRUNER, err);
            }
        }
        self.counters.set_phase(PrunerPhase::Idle);
        result
    }

    async fn worker(self: &Arc<Self>) {
        let interval = Duration::from_secs(self.config.interval_s);
        let mut last_snapshot = self.counters.snapshot();
        let mut last_log_time = Instant::now();

        while let TickReason::Wakeup = self.tick_service.tick(interval).await {
            let pruner = self.clone();
            match tokio::task::spawn_blocking(move || pruner.run_cycle()).await {
                Ok(Err(PruneError::Cancelled)) => {
                    info!("[{}] cycle interrupted by shutdown", PRUNER);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    self.counters.error_count.fetch_add(1, Ordering::Relaxed);
                    self.counters.cycles_abandoned.fetch_add(1, Ordering::Relaxed);
                    self.counters.set_phase(PrunerPhase::Idle);
                    warn!("[{}] cycle task failed: {}", PRUNER, err);
                }
            }

            let snapshot = self.counters.snapshot();
            if snapshot == last_snapshot {
                last_log_time = Instant::now();
                continue;
            }
            let delta = &snapshot - &last_snapshot;
            let now = Instant::now();
            info!(
                "Pruned {} expired and {} incrementally swept nodes in the last {:.2}s ({} reachable nodes scanned; {} bytes reclaimed; {} purged from the recycle bin; {} errors)",
                delta.sweep_expired_deleted,
                delta.incremental_sweep_deleted,
                (now - last_log_time).as_secs_f64(),
                delta.reachable_nodes_scanned,
                delta.disk_space_reclaimed_bytes,
                delta.recycle_bin_purged,
                delta.error_count,
            );
            last_snapshot = snapshot;
            last_log_time = now;
        }

        trace!("{} thread exiting", PRUNER);
    }
}

impl<S: PrunableStore + ?Sized + 'static> AsyncService for StatePruner<S> {
    fn ident(self: Arc<Self>) -> &'static str {
        PRUNER
    }

    fn start(self: Arc<Self>) -> AsyncServiceFuture {
        Box::pin(async move {
            if !self.config.enable {
                info!("[{}] disabled", PRUNER);
                return Ok(());
            }
            info!(
                "[{}] started, every {}s over a window of {} orders",
                PRUNER, self.config.interval_s, self.config.protection_orders
            );
            self.worker().await;
            Ok(())
        })
    }

    fn signal_exit(self: Arc<Self>) {
        trace!("sending an exit signal to {}", PRUNER);
        self.tick_service.shutdown();
    }

    fn stop(self: Arc<Self>) -> AsyncServiceFuture {
        trace!("{} stopping", PRUNER);
        Box::pin(async move {
            trace!("{} exiting", PRUNER);
            Ok(())
        })
    }
}

#[derive(Debug)]
pub struct Unspecified;

/// Type-state builder, `build` is only available once a store and a tick service are set
pub struct Builder<Store, Tick> {
    store: Store,
    tick_service: Tick,
    config: PrunerConfig,
    counters: Option<Arc<PrunerCounters>>,
}

impl Default for Builder<Unspecified, Unspecified> {
    fn default() -> Self {
        Self { store: Unspecified, tick_service: Unspecified, config: PrunerConfig::default(), counters: None }
    }
}

impl Builder<Unspecified, Unspecified> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<Store, Tick> Builder<Store, Tick> {
    pub fn with_store<S: PrunableStore + ?Sized + 'static>(self, store: Arc<S>) -> Builder<Arc<S>, Tick> {
        Builder { store, tick_service: self.tick_service, config: self.config, counters: self.counters }
    }

    pub fn with_tick_service(self, tick_service: Arc<TickService>) -> Builder<Store, Arc<TickService>> {
        Builder { store: self.store, tick_service, config: self.config, counters: self.counters }
    }

    pub fn with_config(self, config: PrunerConfig) -> Self {
        Self { config, ..self }
    }

    pub fn with_counters(self, counters: Arc<PrunerCounters>) -> Self {
        Self { counters: Some(counters), ..self }
    }
}

impl<S: PrunableStore + ?Sized + 'static> Builder<Arc<S>, Arc<TickService>> {
    pub fn build(self) -> PruneResult<StatePruner<S>> {
        self.config.validate()?;
        let meta = DbPrunerMetaStore::new(self.store.db().clone());
        Ok(StatePruner {
            store: self.store,
            config: self.config,
            counters: self.counters.unwrap_or_default(),
            tick_service: self.tick_service,
            meta: Mutex::new(meta),
            cycles: AtomicU64::new(0),
        })
    }
}
