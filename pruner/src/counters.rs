use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Phase of the online pruner, exported as the `currentPhase` gauge
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrunerPhase {
    #[default]
    Idle = 0,
    Marking = 1,
    SweepingExpired = 2,
    IncrementalSweeping = 3,
}

impl PrunerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PrunerPhase::Marking,
            2 => PrunerPhase::SweepingExpired,
            3 => PrunerPhase::IncrementalSweeping,
            _ => PrunerPhase::Idle,
        }
    }
}

#[derive(Default)]
pub struct PrunerCounters {
    pub bloom_filter_size_bytes: AtomicU64,
    current_phase: AtomicU8,
    pub sweep_expired_deleted: AtomicU64,
    pub incremental_sweep_deleted: AtomicU64,
    pub reachable_nodes_scanned: AtomicU64,
    pub disk_space_reclaimed_bytes: AtomicU64,
    pub error_count: AtomicU64,
    pub cycles_completed: AtomicU64,
    pub cycles_abandoned: AtomicU64,
    pub recycle_bin_purged: AtomicU64,
}

impl PrunerCounters {
    pub fn set_phase(&self, phase: PrunerPhase) {
        self.current_phase.store(phase as u8, Ordering::Relaxed);
    }

    pub fn phase(&self) -> PrunerPhase {
        PrunerPhase::from_u8(self.current_phase.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> PrunerCountersSnapshot {
        PrunerCountersSnapshot {
            bloom_filter_size_bytes: self.bloom_filter_size_bytes.load(Ordering::Relaxed),
            current_phase: self.current_phase.load(Ordering::Relaxed),
            sweep_expired_deleted: self.sweep_expired_deleted.load(Ordering::Relaxed),
            incremental_sweep_deleted: self.incremental_sweep_deleted.load(Ordering::Relaxed),
            reachable_nodes_scanned: self.reachable_nodes_scanned.load(Ordering::Relaxed),
            disk_space_reclaimed_bytes: self.disk_space_reclaimed_bytes.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_abandoned: self.cycles_abandoned.load(Ordering::Relaxed),
            recycle_bin_purged: self.recycle_bin_purged.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrunerCountersSnapshot {
    pub bloom_filter_size_bytes: u64,
    pub current_phase: u8,
    pub sweep_expired_deleted: u64,
    pub incremental_sweep_deleted: u64,
    pub reachable_nodes_scanned: u64,
    pub disk_space_reclaimed_bytes: u64,
    pub error_count: u64,
    pub cycles_completed: u64,
    pub cycles_abandoned: u64,
    pub recycle_bin_purged: u64,
}

impl core::ops::Sub for &PrunerCountersSnapshot {
    type Output = PrunerCountersSnapshot;

    fn sub(self, rhs: Self) -> Self::Output {
        Self::Output {
            // Gauges keep their current value
            bloom_filter_size_bytes: self.bloom_filter_size_bytes,
            current_phase: self.current_phase,
            sweep_expired_deleted: self.sweep_expired_deleted.saturating_sub(rhs.sweep_expired_deleted),
            incremental_sweep_deleted: self.incremental_sweep_deleted.saturating_sub(rhs.incremental_sweep_deleted),
            reachable_nodes_scanned: self.reachable_nodes_scanned.saturating_sub(rhs.reachable_nodes_scanned),
            disk_space_reclaimed_bytes: self.disk_space_reclaimed_bytes.saturating_sub(rhs.disk_space_reclaimed_bytes),
            error_count: self.error_count.saturating_sub(rhs.error_count),
            cycles_completed: self.cycles_completed.saturating_sub(rhs.cycles_completed),
            cycles_abandoned: self.cycles_abandoned.saturating_sub(rhs.cycles_abandoned),
            recycle_bin_purged: self.recycle_bin_purged.saturating_sub(rhs.recycle_bin_purged),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_delta_and_json() {
        let counters = PrunerCounters::default();
        counters.reachable_nodes_scanned.fetch_add(10, Ordering::Relaxed);
        counters.bloom_filter_size_bytes.store(1024, Ordering::Relaxed);
        let first = counters.snapshot();

        counters.reachable_nodes_scanned.fetch_add(5, Ordering::Relaxed);
        counters.set_phase(PrunerPhase::IncrementalSweeping);
        let second = counters.snapshot();

        let delta = &second - &first;
        assert_eq!(delta.reachable_nodes_scanned, 5);
        assert_eq!(delta.bloom_filter_size_bytes, 1024);
        assert_eq!(delta.current_phase, 3);
        assert_eq!(counters.phase(), PrunerPhase::IncrementalSweeping);

        let json = serde_json::to_value(&second).unwrap();
        for key in [
            "bloomFilterSizeBytes",
            "currentPhase",
            "sweepExpiredDeleted",
            "incrementalSweepDeleted",
            "reachableNodesScanned",
            "diskSpaceReclaimedBytes",
            "errorCount",
        ] {
            assert!(json.get(key).is_some(), "missing metric {key}");
        }
    }
}
