use crate::{keys::TxOrderKey, node::NodeId};
use rocksdb::WriteBatch;
use std::sync::Arc;
use vstate_database::{
    prelude::{BatchDbWriter, CachePolicy, CachedDbAccess, StoreError, StoreResult, StoreResultExt, DB},
    registry::DatabaseStorePrefixes,
};

pub trait RootStoreReader {
    fn root_at(&self, tx_order: u64) -> StoreResult<Option<NodeId>>;
    /// The `n` roots with the highest tx order, newest first
    fn latest(&self, n: usize) -> StoreResult<Vec<(u64, NodeId)>>;
}

pub trait RootStore: RootStoreReader {
    // Roots are append-only
    fn insert_batch(&self, batch: &mut WriteBatch, tx_order: u64, root: NodeId) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct DbRootStore {
    access: CachedDbAccess<TxOrderKey, NodeId>,
}

impl DbRootStore {
    pub fn new(db: Arc<DB>, cache_policy: CachePolicy) -> Self {
        Self { access: CachedDbAccess::new(db, cache_policy, DatabaseStorePrefixes::Roots.into()) }
    }
}

impl RootStoreReader for DbRootStore {
    fn root_at(&self, tx_order: u64) -> StoreResult<Option<NodeId>> {
        self.access.read(tx_order.into()).optional()
    }

    fn latest(&self, n: usize) -> StoreResult<Vec<(u64, NodeId)>> {
        self.access
            .reverse_iterator(n)
            .map(|item| {
                let (key, root) = item.map_err(|err| StoreError::DataInconsistency(err.to_string()))?;
                let key = TxOrderKey::try_from_slice(&key)
                    .ok_or_else(|| StoreError::DataInconsistency(format!("malformed root key of {} bytes", key.len())))?;
                Ok((key.order(), root))
            })
            .collect()
    }
}

impl RootStore for DbRootStore {
    fn insert_batch(&self, batch: &mut WriteBatch, tx_order: u64, root: NodeId) -> StoreResult<()> {
        if self.access.has(tx_order.into())? {
            return Err(StoreError::KeyAlreadyExists(tx_order.to_string()));
        }
        self.access.write(BatchDbWriter::new(batch), tx_order.into(), root)
    }
}
