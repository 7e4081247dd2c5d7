use crate::errors::{PruneError, PruneResult};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_MAX_ERROR_RATIO: f64 = 0.05;
/// Datasets up to this many nodes are marked with the exact in-memory set under `auto`
pub const DEFAULT_MEMORY_MARKER_NODE_LIMIT: u64 = 5_000_000;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStrategy {
    #[default]
    Auto,
    Memory,
    Persistent,
}

impl Display for MarkerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarkerStrategy::Auto => "auto",
            MarkerStrategy::Memory => "memory",
            MarkerStrategy::Persistent => "persistent",
        };
        f.write_str(s)
    }
}

impl FromStr for MarkerStrategy {
    type Err = PruneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(MarkerStrategy::Auto),
            "memory" => Ok(MarkerStrategy::Memory),
            "persistent" | "bloom" => Ok(MarkerStrategy::Persistent),
            other => Err(PruneError::InvalidConfig(format!("unknown marker strategy '{other}', expected auto|memory|persistent"))),
        }
    }
}

/// Free space thresholds guarding recycle bin writes, in percent of the disk holding the database
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DiskSpaceThresholds {
    pub enabled: bool,
    pub warning_pct: u64,
    pub critical_pct: u64,
    /// At or below this no recycle record is written
    pub stop_pct: u64,
}

impl Default for DiskSpaceThresholds {
    fn default() -> Self {
        Self { enabled: true, warning_pct: 20, critical_pct: 10, stop_pct: 5 }
    }
}

impl DiskSpaceThresholds {
    pub fn validate(&self) -> PruneResult<()> {
        if !(self.stop_pct <= self.critical_pct && self.critical_pct <= self.warning_pct && self.warning_pct <= 100) {
            return Err(PruneError::InvalidConfig(format!(
                "disk space thresholds must satisfy stop ({}) <= critical ({}) <= warning ({}) <= 100",
                self.stop_pct, self.critical_pct, self.warning_pct
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RecycleBinConfig {
    /// Entries younger than this are never auto-purged
    pub grace_period_secs: u64,
    pub auto_purge: bool,
    pub disk_space: DiskSpaceThresholds,
}

impl Default for RecycleBinConfig {
    fn default() -> Self {
        Self { grace_period_secs: DEFAULT_GRACE_PERIOD_SECS, auto_purge: false, disk_space: DiskSpaceThresholds::default() }
    }
}

/// Parameters of one offline `db gc` pass
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GcConfig {
    pub chain_id: u64,
    pub dry_run: bool,
    pub batch_size: usize,
    pub workers: usize,
    pub marker_strategy: MarkerStrategy,
    pub use_recycle_bin: bool,
    pub protected_roots_count: u64,
    pub force: bool,
    pub verbose: bool,
    pub yes: bool,
    pub json: bool,
    pub compact: bool,
    pub max_error_ratio: f64,
    pub memory_marker_node_limit: u64,
    /// Guards writes into the recycle bin when `use_recycle_bin` is set
    pub disk_space: DiskSpaceThresholds,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            chain_id: 0,
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: num_cpus::get().max(1),
            marker_strategy: MarkerStrategy::Auto,
            use_recycle_bin: false,
            protected_roots_count: 1,
            force: false,
            verbose: false,
            yes: false,
            json: false,
            compact: false,
            max_error_ratio: DEFAULT_MAX_ERROR_RATIO,
            memory_marker_node_limit: DEFAULT_MEMORY_MARKER_NODE_LIMIT,
            disk_space: DiskSpaceThresholds::default(),
        }
    }
}

impl GcConfig {
    pub fn validate(&self) -> PruneResult<()> {
        validate_common(self.batch_size, self.workers, self.max_error_ratio)?;
        self.disk_space.validate()
    }
}

/// Parameters of the online pruner running inside the node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PrunerConfig {
    pub enable: bool,
    pub enable_incremental_sweep: bool,
    pub interval_s: u64,
    pub protection_orders: u64,
    pub bloom_bits: u64,
    pub scan_batch: usize,
    pub delete_batch: usize,
    /// A sweep of the whole stale index replaces the incremental one every this many cycles
    pub full_sweep_every: u64,
    pub workers: usize,
    pub use_recycle_bin: bool,
    pub max_error_ratio: f64,
    pub recycle_bin: RecycleBinConfig,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            enable_incremental_sweep: true,
            interval_s: 60,
            protection_orders: 30_000,
            bloom_bits: 1 << 23,
            scan_batch: 10_000,
            delete_batch: 5_000,
            full_sweep_every: 10,
            workers: (num_cpus::get() / 2).max(1),
            use_recycle_bin: true,
            max_error_ratio: DEFAULT_MAX_ERROR_RATIO,
            recycle_bin: RecycleBinConfig::default(),
        }
    }
}

impl PrunerConfig {
    pub fn validate(&self) -> PruneResult<()> {
        validate_common(self.scan_batch, self.workers, self.max_error_ratio)?;
        if self.delete_batch == 0 {
            return Err(PruneError::InvalidConfig("delete batch must be positive".to_string()));
        }
        if self.interval_s == 0 {
            return Err(PruneError::InvalidConfig("pruner interval must be positive".to_string()));
        }
        if self.bloom_bits == 0 {
            return Err(PruneError::InvalidConfig("bloom bits must be positive".to_string()));
        }
        self.recycle_bin.disk_space.validate()
    }
}

fn validate_common(batch_size: usize, workers: usize, max_error_ratio: f64) -> PruneResult<()> {
    if batch_size == 0 {
        return Err(PruneError::InvalidConfig("batch size must be positive".to_string()));
    }
    if workers == 0 {
        return Err(PruneError::InvalidConfig("worker count must be positive".to_string()));
    }
    if !(0.0..=1.0).contains(&max_error_ratio) {
        return Err(PruneError::InvalidConfig(format!("max error ratio {max_error_ratio} is outside [0, 1]")));
    }
    Ok(())
}
