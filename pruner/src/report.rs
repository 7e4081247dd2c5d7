use crate::{marker::MarkStats, sweeper::SweepStats};
use serde::{Serialize, Serializer};
use std::{fmt, time::Duration};

/// Serializes a duration as fractional seconds
pub fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ExecutionMode {
    #[serde(rename = "dryRun")]
    DryRun,
    #[serde(rename = "execute")]
    Execute,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::DryRun => f.write_str("Dry Run"),
            ExecutionMode::Execute => f.write_str("Execute"),
        }
    }
}

/// Final outcome of a `db gc` pass
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcReport {
    pub execution_mode: ExecutionMode,
    pub protected_roots: usize,
    pub mark: MarkStats,
    pub sweep: SweepStats,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub space_reclaimed_pct: f64,
    #[serde(serialize_with = "serialize_secs")]
    pub total_duration: Duration,
}

impl GcReport {
    pub fn new(
        execution_mode: ExecutionMode,
        protected_roots: usize,
        mark: MarkStats,
        sweep: SweepStats,
        bytes_before: u64,
        bytes_after: u64,
        total_duration: Duration,
    ) -> Self {
        let reclaimed = match execution_mode {
            ExecutionMode::Execute => bytes_before.saturating_sub(bytes_after),
            ExecutionMode::DryRun => sweep.bytes_reclaimed.min(bytes_before),
        };
        let space_reclaimed_pct = if bytes_before == 0 { 0.0 } else { reclaimed as f64 / bytes_before as f64 * 100.0 };
        Self { execution_mode, protected_roots, mark, sweep, bytes_before, bytes_after, space_reclaimed_pct, total_duration }
    }

    /// Whether the pass finished without errors, failed batches or an abort
    pub fn is_clean(&self) -> bool {
        self.mark.traversal_errors == 0 && self.sweep.is_clean()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for GcReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Garbage Collection Report ===")?;
        writeln!(f, "  Execution Mode: {}", self.execution_mode)?;
        writeln!(f)?;
        writeln!(f, "Mark Phase:")?;
        writeln!(f, "  Protected Roots: {}", self.protected_roots)?;
        writeln!(f, "  Nodes Marked Reachable: {}", self.mark.marked_count)?;
        writeln!(f, "  Memory Strategy: {}", self.mark.strategy_used)?;
        writeln!(f, "  Duration: {:.2} seconds", self.mark.duration.as_secs_f64())?;
        writeln!(f, "  Traversal Errors: {}", self.mark.traversal_errors)?;
        writeln!(f)?;
        writeln!(f, "Sweep Phase:")?;
        writeln!(f, "  Nodes Scanned: {}", self.sweep.scanned_count)?;
        writeln!(f, "  Nodes Kept (Reachable): {}", self.sweep.kept_count)?;
        writeln!(f, "  Nodes Deleted (Unreachable): {}", self.sweep.deleted_count)?;
        writeln!(f, "  Nodes Sent to Recycle Bin: {}", self.sweep.recycle_bin_entries)?;
        writeln!(f, "  Bytes Reclaimed: {}", self.sweep.bytes_reclaimed)?;
        writeln!(f, "  Duration: {:.2} seconds", self.sweep.duration.as_secs_f64())?;
        writeln!(f, "  Failed Batches: {}", self.sweep.failed_batches)?;
        writeln!(f, "  Error Count: {}", self.sweep.error_count)?;
        if self.sweep.aborted {
            writeln!(f, "  Sweep Aborted: true")?;
        }
        writeln!(f)?;
        writeln!(f, "Summary:")?;
        writeln!(f, "  Memory Strategy Used: {}", self.mark.strategy_used)?;
        writeln!(f, "  Total Execution Time: {:.2} seconds", self.total_duration.as_secs_f64())?;
        write!(f, "  Space Reclaimed: {:.2}%", self.space_reclaimed_pct)
    }
}
