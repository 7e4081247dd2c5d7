use rocksdb::WriteBatch;
use std::sync::Arc;
use vstate_database::{
    prelude::{BatchDbWriter, CachedDbItem, StoreResult, StoreResultExt, DB},
    registry::DatabaseStorePrefixes,
};

/// The chain id a data directory was created for
#[derive(Clone)]
pub struct DbChainIdentityStore {
    access: CachedDbItem<u64>,
}

impl DbChainIdentityStore {
    pub fn new(db: Arc<DB>) -> Self {
        Self { access: CachedDbItem::new(db, DatabaseStorePrefixes::ChainIdentity.into()) }
    }

    pub fn get(&self) -> StoreResult<Option<u64>> {
        self.access.read().optional()
    }

    pub fn set_batch(&mut self, batch: &mut WriteBatch, chain_id: u64) -> StoreResult<()> {
        self.access.write(BatchDbWriter::new(batch), &chain_id)
    }
}
