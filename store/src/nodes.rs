use crate::node::{NodeId, StateNode};
use rocksdb::WriteBatch;
use std::sync::Arc;
use vstate_database::{
    prelude::{BatchDbWriter, CachePolicy, CachedDbAccess, StoreError, StoreResult, DB},
    registry::DatabaseStorePrefixes,
};
use vstate_hashes::Hash;

pub trait NodeStoreReader {
    fn get(&self, id: NodeId) -> StoreResult<StateNode>;
    fn has(&self, id: NodeId) -> StoreResult<bool>;
    fn size_of(&self, id: NodeId) -> StoreResult<u64>;
    /// The persisted bytes, returned even when they no longer decode
    fn raw_bytes(&self, id: NodeId) -> StoreResult<Vec<u8>>;
    /// Up to `limit` node ids in key order, strictly after `after` when given
    fn ids_after(&self, after: Option<NodeId>, limit: usize) -> StoreResult<Vec<NodeId>>;
}

pub trait NodeStore: NodeStoreReader {
    fn insert_batch(&self, batch: &mut WriteBatch, node: &StateNode) -> StoreResult<NodeId>;
    fn delete_batch(&self, batch: &mut WriteBatch, ids: &[NodeId]) -> StoreResult<()>;
}

/// A DB + cache implementation of `NodeStore` trait, with concurrency support.
#[derive(Clone)]
pub struct DbNodeStore {
    access: CachedDbAccess<NodeId, StateNode>,
}

impl DbNodeStore {
    pub fn new(db: Arc<DB>, cache_policy: CachePolicy) -> Self {
        Self { access: CachedDbAccess::new(db, cache_policy, DatabaseStorePrefixes::Nodes.into()) }
    }

    /// Writes a node under an explicit id, used when restoring soft-deleted bytes
    pub fn write_raw_batch(&self, batch: &mut WriteBatch, id: NodeId, bytes: &[u8]) -> StoreResult<()> {
        let node: StateNode = bincode::deserialize(bytes)?;
        self.access.write(BatchDbWriter::new(batch), id, node)
    }
}

impl NodeStoreReader for DbNodeStore {
    fn get(&self, id: NodeId) -> StoreResult<StateNode> {
        self.access.read(id)
    }

    fn has(&self, id: NodeId) -> StoreResult<bool> {
        self.access.has(id)
    }

    fn size_of(&self, id: NodeId) -> StoreResult<u64> {
        Ok(self.access.read_len(id)? as u64)
    }

    fn raw_bytes(&self, id: NodeId) -> StoreResult<Vec<u8>> {
        self.access.read_raw(id)
    }

    fn ids_after(&self, after: Option<NodeId>, limit: usize) -> StoreResult<Vec<NodeId>> {
        let skip_first = after.is_some();
        self.access
            .seek_keys(after, limit, skip_first)
            .map(|key| {
                let key = key?;
                Hash::try_from_slice(&key).ok_or_else(|| StoreError::DataInconsistency(format!("malformed node key of {} bytes", key.len())))
            })
            .collect()
    }
}

impl NodeStore for DbNodeStore {
    fn insert_batch(&self, batch: &mut WriteBatch, node: &StateNode) -> StoreResult<NodeId> {
        let id = node.id();
        if self.access.has(id)? {
            return Err(StoreError::HashAlreadyExists(id));
        }
        self.access.write(BatchDbWriter::new(batch), id, node.clone())?;
        Ok(id)
    }

    fn delete_batch(&self, batch: &mut WriteBatch, ids: &[NodeId]) -> StoreResult<()> {
        self.access.delete_many(BatchDbWriter::new(batch), &mut ids.iter().copied())
    }
}
