use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vstate_database::{
    prelude::{CachedDbItem, DirectDbWriter, StoreResult, StoreResultExt, DB},
    registry::DatabaseStorePrefixes,
};

/// Progress of the online pruner, persisted after every successful cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunerMeta {
    /// Stale entries below this order have been swept
    pub cutoff_watermark: u64,
    pub completed_cycles: u64,
    /// Unix time in milliseconds
    pub last_cycle_at: u64,
}

#[derive(Clone)]
pub struct DbPrunerMetaStore {
    db: Arc<DB>,
    access: CachedDbItem<PrunerMeta>,
}

impl DbPrunerMetaStore {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db: db.clone(), access: CachedDbItem::new(db, DatabaseStorePrefixes::PrunerMeta.into()) }
    }

    pub fn get(&self) -> StoreResult<Option<PrunerMeta>> {
        self.access.read().optional()
    }

    pub fn set(&mut self, meta: PrunerMeta) -> StoreResult<()> {
        self.access.write(DirectDbWriter::new(&self.db), &meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vstate_database::{create_temp_db, prelude::ConnBuilder};

    #[test]
    fn test_meta_persists_across_instances() {
        let (_lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        let mut store = DbPrunerMetaStore::new(db.clone());
        assert_eq!(store.get().unwrap(), None);

        let meta = PrunerMeta { cutoff_watermark: 120, completed_cycles: 4, last_cycle_at: 99 };
        store.set(meta).unwrap();
        assert_eq!(DbPrunerMetaStore::new(db.clone()).get().unwrap(), Some(meta));
    }
}
