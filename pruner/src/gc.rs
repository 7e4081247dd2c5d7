use crate::{
    config::GcConfig,
    counters::PrunerCounters,
    errors::{PruneError, PruneResult},
    marker::{mark, resolve_strategy, MarkStats, ReachabilityMarker},
    recycle_bin::DiskSpaceGuard,
    report::{ExecutionMode, GcReport},
    roots::{ProtectedRootSet, RootRegistry},
    sweeper::{sweep, SweepOptions, SweepStats},
};
use parking_lot::RwLock;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use vstate_core::{debug, info, trace};
use vstate_store::PrunableStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcState {
    Idle,
    Validating,
    Marking,
    Sweeping,
    Reporting,
}

impl fmt::Display for GcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

type Confirmation = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Offline mark-and-sweep over a closed store.
///
/// A pass goes through `Validating`, `Marking`, `Sweeping` and `Reporting` and always
/// returns to `Idle`, whatever its outcome. Marking completes before the first sweep batch.
pub struct GarbageCollector<S: PrunableStore + ?Sized> {
    store: Arc<S>,
    config: GcConfig,
    counters: Arc<PrunerCounters>,
    state: RwLock<GcState>,
    confirmation: Option<Confirmation>,
    stop: Arc<AtomicBool>,
}

impl<S: PrunableStore + ?Sized> GarbageCollector<S> {
    pub fn new(store: Arc<S>, config: GcConfig, counters: Arc<PrunerCounters>) -> Self {
        Self { store, config, counters, state: RwLock::new(GcState::Idle), confirmation: None, stop: Default::default() }
    }

    /// Asked before any mutation in execute mode unless `yes` is set. A `false` answer aborts the pass.
    pub fn with_confirmation(self, confirmation: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self { confirmation: Some(Box::new(confirmation)), ..self }
    }

    /// Setting the returned flag stops the pass at the next level or wave boundary
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn state(&self) -> GcState {
        *self.state.read()
    }

    fn transition(&self, next: GcState) {
        let mut state = self.state.write();
        info!("[GC] {} -> {}", *state, next);
        *state = next;
    }

    pub fn run(&self) -> PruneResult<GcReport> {
        let result = self.run_pass();
        self.transition(GcState::Idle);
        result
    }

    fn validate(&self) -> PruneResult<()> {
        if !self.config.dry_run && !self.config.force {
            return Err(PruneError::force_required());
        }
        self.config.validate()?;
        match self.store.chain_id()? {
            Some(found) if found == self.config.chain_id => Ok(()),
            found => Err(PruneError::ConfigMismatch {
                expected: self.config.chain_id.to_string(),
                found: found.map_or_else(|| "none".to_string(), |id| id.to_string()),
            }),
        }
    }

    fn mark_and_sweep(
        &self,
        protected: &ProtectedRootSet,
        marker: &ReachabilityMarker,
        mode: ExecutionMode,
    ) -> PruneResult<(MarkStats, SweepStats)> {
        let should_stop = || self.stop.load(Ordering::Relaxed);
        let mark_stats = mark(self.store.as_ref(), protected, marker, self.config.workers, &self.counters, should_stop)?;
        trace!("[GC] Marker false positive estimate {:.6}", marker.estimated_fp_rate());

        if mode == ExecutionMode::Execute && !self.config.yes {
            let prompt = format!(
                "{} nodes are reachable from {} protected roots. Every other node will be deleted{}. Proceed?",
                mark_stats.marked_count,
                protected.len(),
                if self.config.use_recycle_bin { " into the recycle bin" } else { " permanently" }
            );
            if !self.confirmation.as_ref().is_some_and(|confirm| confirm(&prompt)) {
                return Err(PruneError::UserRejected);
            }
        }

        self.transition(GcState::Sweeping);
        let options = SweepOptions {
            dry_run: self.config.dry_run,
            batch_size: self.config.batch_size,
            workers: self.config.workers,
            use_recycle_bin: self.config.use_recycle_bin,
            max_error_ratio: self.config.max_error_ratio,
            cutoff_order: protected.cutoff_order().unwrap_or_default(),
            disk_guard: DiskSpaceGuard::for_db(self.config.disk_space, self.store.db()),
        };
        let sweep_stats = sweep(self.store.as_ref(), marker, &options, &self.counters, should_stop)?;
        Ok((mark_stats, sweep_stats))
    }

    fn run_pass(&self) -> PruneResult<GcReport> {
        let start = Instant::now();
        let mode = if self.config.dry_run { ExecutionMode::DryRun } else { ExecutionMode::Execute };

        self.transition(GcState::Validating);
        self.validate()?;
        let bytes_before = self.store.disk_usage()?;

        let protected = RootRegistry::load_protected(self.store.as_ref(), self.config.protected_roots_count)?;
        if protected.is_empty() && mode == ExecutionMode::Execute {
            return Err(PruneError::SafetyGateViolation("the store has no committed roots, nothing can be protected".to_string()));
        }
        debug!("[GC] Protecting {} roots, cutoff order {:?}", protected.len(), protected.cutoff_order());

        let estimate = self.store.estimated_node_count();
        let strategy = resolve_strategy(self.config.marker_strategy, estimate, self.config.memory_marker_node_limit);
        info!("[GC] Using {} marker for an estimated {:?} nodes", strategy, estimate);

        self.transition(GcState::Marking);
        let marker = ReachabilityMarker::for_strategy(strategy, estimate, self.store.db().clone())?;
        self.counters.bloom_filter_size_bytes.store(marker.size_bytes(), Ordering::Relaxed);
        let passed = self.mark_and_sweep(&protected, &marker, mode);
        let released = marker.release();
        let (mark_stats, sweep_stats) = passed?;
        released?;

        if mode == ExecutionMode::Execute && self.config.compact {
            info!("[GC] Compacting the store");
            self.store.compact();
        }

        self.transition(GcState::Reporting);
        let bytes_after = match mode {
            ExecutionMode::Execute => self.store.disk_usage()?,
            ExecutionMode::DryRun => bytes_before,
        };
        Ok(GcReport::new(mode, protected.len(), mark_stats, sweep_stats, bytes_before, bytes_after, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DiskSpaceThresholds, MarkerStrategy},
        marker::reach_seen::DbReachSeenStore,
        recycle_bin::RecycleBinStore,
        testing::{TestChain, TEST_CHAIN_ID},
    };
    use std::sync::atomic::AtomicUsize;
    use vstate_core::log::try_init_logger;
    use vstate_database::{create_temp_db, prelude::ConnBuilder};
    use vstate_store::StateStore;

    fn scenario() -> TestChain {
        let mut chain = TestChain::new();
        chain.populate(100);
        chain.update_range(0..50, b"updated");
        chain.remove_range(50..80);
        chain.touch(20);
        chain
    }

    fn config(dry_run: bool, protected_roots_count: u64) -> GcConfig {
        GcConfig {
            chain_id: TEST_CHAIN_ID,
            dry_run,
            batch_size: 64,
            workers: 2,
            protected_roots_count,
            disk_space: DiskSpaceThresholds { enabled: false, ..Default::default() },
            ..Default::default()
        }
    }

    fn collector(chain: &TestChain, config: GcConfig) -> GarbageCollector<StateStore> {
        GarbageCollector::new(chain.store.clone(), config, Default::default())
    }

    #[test]
    fn test_dry_run_scenario() {
        try_init_logger("info");
        let chain = scenario();
        let before = chain.all_nodes();
        for strategy in [MarkerStrategy::Auto, MarkerStrategy::Memory, MarkerStrategy::Persistent] {
            let gc = collector(&chain, GcConfig { marker_strategy: strategy, ..config(true, 1) });
            let report = gc.run().unwrap();
            assert_eq!(gc.state(), GcState::Idle);
            assert_eq!(report.execution_mode, ExecutionMode::DryRun);
            assert_eq!(report.protected_roots, 1);
            assert!(report.mark.marked_count > 0);
            assert!(["Memory", "Persistent"].contains(&report.mark.strategy_used));
            assert_eq!(report.sweep.error_count, 0);
            assert!(report.is_clean());
            assert!(report.sweep.deleted_count > 0);
        }
        assert_eq!(chain.all_nodes(), before);
    }

    #[test]
    fn test_execute_requires_force() {
        let chain = scenario();
        let before = chain.node_count();
        let gc = collector(&chain, config(false, 1));
        let err = gc.run().unwrap_err();
        assert!(matches!(err, PruneError::SafetyGateViolation(_)));
        assert_eq!(err.to_string(), PruneError::force_required().to_string());
        assert!(err.to_string().contains("--force"));
        assert_eq!(gc.state(), GcState::Idle);
        assert_eq!(chain.node_count(), before);

        // The safety gate is checked before anything else
        let gc = collector(&chain, GcConfig { batch_size: 0, chain_id: 7, ..config(false, 1) });
        assert!(matches!(gc.run(), Err(PruneError::SafetyGateViolation(_))));
        let gc = collector(&chain, GcConfig { batch_size: 0, chain_id: 7, ..config(true, 1) });
        assert!(matches!(gc.run(), Err(PruneError::InvalidConfig(_))));
    }

    #[test]
    fn test_chain_identity_is_checked() {
        let chain = scenario();
        let gc = collector(&chain, GcConfig { chain_id: TEST_CHAIN_ID + 1, ..config(true, 1) });
        match gc.run() {
            Err(PruneError::ConfigMismatch { expected, found }) => {
                assert_eq!(expected, (TEST_CHAIN_ID + 1).to_string());
                assert_eq!(found, TEST_CHAIN_ID.to_string());
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let (_lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        let unlabelled = Arc::new(StateStore::new(db.clone()));
        let gc = GarbageCollector::new(unlabelled, config(true, 1), Default::default());
        assert!(matches!(gc.run(), Err(PruneError::ConfigMismatch { .. })));
    }

    #[test]
    fn test_execute_deletes_only_unreachable() {
        let chain = scenario();
        let reachable = chain.reference_reachable(3);
        let gc = collector(&chain, GcConfig { force: true, yes: true, use_recycle_bin: true, compact: true, ..config(false, 3) });
        let report = gc.run().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.execution_mode, ExecutionMode::Execute);
        assert_eq!(chain.node_count(), reachable.len());
        assert!(reachable.iter().all(|id| chain.store.has_node(*id).unwrap()));
        assert_eq!(RecycleBinStore::new(chain.store.db().clone()).stats().unwrap().entries, report.sweep.deleted_count);
        assert!(report.space_reclaimed_pct >= 0.0);

        // A second pass finds nothing left to delete
        let report = gc.run().unwrap();
        assert_eq!(report.sweep.deleted_count, 0);
        assert_eq!(report.sweep.scanned_count, report.sweep.kept_count);
    }

    #[test]
    fn test_confirmation() {
        let chain = scenario();
        let before = chain.node_count();
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = asked.clone();
        let gc = collector(&chain, GcConfig { force: true, ..config(false, 1) }).with_confirmation(move |prompt| {
            assert!(prompt.contains("protected roots"));
            counter.fetch_add(1, Ordering::Relaxed);
            false
        });
        assert!(matches!(gc.run(), Err(PruneError::UserRejected)));
        assert_eq!(asked.load(Ordering::Relaxed), 1);
        assert_eq!(chain.node_count(), before);

        // Without a confirmation callback and without `yes` the pass is declined
        let gc = collector(&chain, GcConfig { force: true, ..config(false, 1) });
        assert!(matches!(gc.run(), Err(PruneError::UserRejected)));

        let gc = collector(&chain, GcConfig { force: true, ..config(false, 1) }).with_confirmation(|_| true);
        assert!(gc.run().unwrap().sweep.deleted_count > 0);
    }

    #[test]
    fn test_wider_window_marks_more() {
        let chain = scenario();
        let mut previous = 0;
        for count in [1, 2, 5, 20, 1000] {
            let report = collector(&chain, config(true, count)).run().unwrap();
            assert!(report.mark.marked_count >= previous);
            previous = report.mark.marked_count;
        }
    }

    #[test]
    fn test_stop_cancels_pass() {
        let chain = scenario();
        let gc = collector(&chain, config(true, 5));
        gc.stop_handle().store(true, Ordering::Relaxed);
        assert!(matches!(gc.run(), Err(PruneError::Cancelled)));
        assert_eq!(gc.state(), GcState::Idle);

        // A cancelled pass leaves no reach-seen records behind
        let gc = collector(&chain, GcConfig { marker_strategy: MarkerStrategy::Persistent, ..config(true, 5) });
        gc.stop_handle().store(true, Ordering::Relaxed);
        assert!(matches!(gc.run(), Err(PruneError::Cancelled)));
        assert!(DbReachSeenStore::new(chain.store.db().clone()).is_empty());
    }

    #[test]
    fn test_rejected_pass_releases_marker() {
        let chain = scenario();
        let gc = collector(&chain, GcConfig { force: true, marker_strategy: MarkerStrategy::Persistent, ..config(false, 1) })
            .with_confirmation(|_| false);
        assert!(matches!(gc.run(), Err(PruneError::UserRejected)));
        assert!(DbReachSeenStore::new(chain.store.db().clone()).is_empty());
    }
}
