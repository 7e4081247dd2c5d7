use crate::{node::NodeId, stale::StaleEntry};
use rocksdb::WriteBatch;
use std::sync::Arc;
use vstate_database::prelude::{StoreResult, DB};

/// What the pruning subsystem needs from the node store hosting it.
///
/// Mutations are staged into caller-owned [`WriteBatch`]es and only become visible
/// once committed through [`PrunableStore::write_batch`], which makes every sweep batch atomic.
pub trait PrunableStore: Send + Sync {
    /// The shared database handle, used for stores owned by the pruner itself
    fn db(&self) -> &Arc<DB>;

    /// Batched full iteration over node ids in key order, strictly after `after`
    fn node_ids_after(&self, after: Option<NodeId>, limit: usize) -> StoreResult<Vec<NodeId>>;

    fn children(&self, id: NodeId) -> StoreResult<Vec<NodeId>>;

    /// The persisted bytes of a node
    fn node_bytes(&self, id: NodeId) -> StoreResult<Vec<u8>>;

    fn node_size(&self, id: NodeId) -> StoreResult<u64>;

    fn delete_nodes_batch(&self, batch: &mut WriteBatch, ids: &[NodeId]) -> StoreResult<()>;

    fn restore_node_batch(&self, batch: &mut WriteBatch, id: NodeId, bytes: &[u8]) -> StoreResult<()>;

    /// The `n` most recent roots, newest first
    fn latest_roots(&self, n: usize) -> StoreResult<Vec<(u64, NodeId)>>;

    fn root_at(&self, tx_order: u64) -> StoreResult<Option<NodeId>>;

    /// Stale index entries with `from <= tx_order < cutoff`
    fn stale_before(&self, from: u64, cutoff: u64, limit: usize) -> StoreResult<Vec<StaleEntry>>;

    /// Stale index entries strictly after `after` and below `cutoff`, for paging past entries which were kept
    fn stale_after(&self, after: StaleEntry, cutoff: u64, limit: usize) -> StoreResult<Vec<StaleEntry>>;

    fn delete_stale_batch(&self, batch: &mut WriteBatch, entries: &[StaleEntry]) -> StoreResult<()>;

    fn write_batch(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Bytes currently used on disk
    fn disk_usage(&self) -> StoreResult<u64>;

    fn estimated_node_count(&self) -> Option<u64>;

    fn chain_id(&self) -> StoreResult<Option<u64>>;

    fn compact(&self);
}
