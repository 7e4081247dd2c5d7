use rocksdb::WriteBatch;
use std::sync::Arc;
use vstate_database::{
    prelude::{BatchDbWriter, CachePolicy, CachedDbAccess, DirectDbWriter, StoreResult, DB},
    registry::DatabaseStorePrefixes,
};
use vstate_store::NodeId;

/// Exact on-disk record of the nodes marked during the current pass. It confirms
/// bloom filter hits so that traversal never prunes on a false positive.
#[derive(Clone)]
pub struct DbReachSeenStore {
    db: Arc<DB>,
    access: CachedDbAccess<NodeId, ()>,
}

impl DbReachSeenStore {
    pub fn new(db: Arc<DB>) -> Self {
        Self { access: CachedDbAccess::new(db.clone(), CachePolicy::Empty, DatabaseStorePrefixes::ReachSeen.into()), db }
    }

    pub fn has(&self, id: NodeId) -> StoreResult<bool> {
        self.access.has(id)
    }

    pub fn insert_batch(&self, batch: &mut WriteBatch, id: NodeId) -> StoreResult<()> {
        self.access.write(BatchDbWriter::new(batch), id, ())
    }

    pub fn write(&self, batch: WriteBatch) -> StoreResult<()> {
        Ok(self.db.write(batch)?)
    }

    pub fn is_empty(&self) -> bool {
        self.access.iterator().next().is_none()
    }

    pub fn clear(&self) -> StoreResult<()> {
        self.access.delete_all(DirectDbWriter::new(&self.db))
    }
}
