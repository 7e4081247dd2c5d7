use thiserror::Error;
use vstate_database::prelude::StoreError;
use vstate_hashes::Hash;

#[derive(Error, Debug)]
pub enum PruneError {
    #[error("chain id mismatch: expected {expected}, found {found}")]
    ConfigMismatch { expected: String, found: String },

    #[error("refusing to mutate the store: {0}")]
    SafetyGateViolation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("traversal fault at node {node}: {reason}")]
    TraversalFault { node: Hash, reason: String },

    #[error("batch {batch} failed: {reason}")]
    BatchWorkerFault { batch: u64, reason: String },

    #[error("storage error: {0}")]
    StorageIo(#[from] StoreError),

    #[error("sweep aborted after {failed} failed batches out of {processed}")]
    SweepAborted { failed: u64, processed: u64 },

    #[error("operation declined by the user")]
    UserRejected,

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("disk space exhausted ({available_pct}% available at {path}), free up space or purge the recycle bin")]
    DiskSpaceExhausted { available_pct: u64, path: String },
}

impl PruneError {
    /// The refusal of execute mode without `--force`
    pub fn force_required() -> Self {
        Self::SafetyGateViolation(
            "execute mode deletes nodes permanently, pass --force to proceed or --dry-run to preview".to_string(),
        )
    }
}

pub type PruneResult<T> = std::result::Result<T, PruneError>;
