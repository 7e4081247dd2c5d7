use crate::{
    identity::DbChainIdentityStore,
    node::{NodeId, StateNode},
    nodes::{DbNodeStore, NodeStore, NodeStoreReader},
    prunable::PrunableStore,
    roots::{DbRootStore, RootStore, RootStoreReader},
    stale::{DbStaleIndexStore, StaleEntry},
};
use parking_lot::RwLock;
use rocksdb::WriteBatch;
use std::{fs, path::Path, sync::Arc};
use vstate_core::{debug, info};
use vstate_database::prelude::{CachePolicy, StoreError, StoreResult, StoreResultUnitExt, DB};

const NODE_CACHE_SIZE: usize = 8192;
const ROOT_CACHE_SIZE: usize = 256;

/// The node store of the versioned state tree: content-addressed nodes, the root registry
/// keyed by transaction order, and the index of nodes superseded by each commit
pub struct StateStore {
    db: Arc<DB>,
    nodes: DbNodeStore,
    roots: DbRootStore,
    stale: DbStaleIndexStore,
    identity: RwLock<DbChainIdentityStore>,
}

impl StateStore {
    pub fn new(db: Arc<DB>) -> Self {
        Self {
            nodes: DbNodeStore::new(db.clone(), CachePolicy::Count(NODE_CACHE_SIZE)),
            roots: DbRootStore::new(db.clone(), CachePolicy::Count(ROOT_CACHE_SIZE)),
            stale: DbStaleIndexStore::new(db.clone()),
            identity: RwLock::new(DbChainIdentityStore::new(db.clone())),
            db,
        }
    }

    /// Opens a store and records `chain_id` if the directory is fresh
    pub fn init(db: Arc<DB>, chain_id: u64) -> StoreResult<Self> {
        let store = Self::new(db);
        let mut identity = store.identity.write();
        match identity.get()? {
            Some(recorded) if recorded != chain_id => {
                return Err(StoreError::DataInconsistency(format!(
                    "store was created for chain {recorded} but opened for chain {chain_id}"
                )));
            }
            Some(_) => {}
            None => {
                let mut batch = WriteBatch::default();
                identity.set_batch(&mut batch, chain_id)?;
                store.db.write(batch)?;
                info!("Initialized state store for chain {}", chain_id);
            }
        }
        drop(identity);
        Ok(store)
    }

    pub fn nodes(&self) -> &DbNodeStore {
        &self.nodes
    }

    pub fn roots(&self) -> &DbRootStore {
        &self.roots
    }

    pub fn get_node(&self, id: NodeId) -> StoreResult<StateNode> {
        self.nodes.get(id)
    }

    pub fn has_node(&self, id: NodeId) -> StoreResult<bool> {
        self.nodes.has(id)
    }

    /// Atomically commits the state produced by transaction `tx_order`: the new root, the
    /// nodes it introduced, and the nodes it stopped referencing
    pub fn commit(&self, tx_order: u64, root: NodeId, new_nodes: &[StateNode], stale_nodes: &[NodeId]) -> StoreResult<()> {
        let mut batch = WriteBatch::default();
        for node in new_nodes {
            // Content addressing makes re-inserting a known node a no-op
            self.nodes.insert_batch(&mut batch, node).map(|_| ()).idempotent()?;
        }
        self.roots.insert_batch(&mut batch, tx_order, root)?;
        for &node in stale_nodes {
            self.stale.insert_batch(&mut batch, StaleEntry::new(tx_order, node))?;
        }
        self.db.write(batch)?;
        debug!("Committed root {} at tx order {} ({} new, {} stale)", root, tx_order, new_nodes.len(), stale_nodes.len());
        Ok(())
    }

    fn directory_size(path: &Path) -> std::io::Result<u64> {
        let mut total = 0;
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            total += if metadata.is_dir() { Self::directory_size(&entry.path())? } else { metadata.len() };
        }
        Ok(total)
    }
}

impl PrunableStore for StateStore {
    fn db(&self) -> &Arc<DB> {
        &self.db
    }

    fn node_ids_after(&self, after: Option<NodeId>, limit: usize) -> StoreResult<Vec<NodeId>> {
        self.nodes.ids_after(after, limit)
    }

    fn children(&self, id: NodeId) -> StoreResult<Vec<NodeId>> {
        Ok(self.nodes.get(id)?.children)
    }

    fn node_bytes(&self, id: NodeId) -> StoreResult<Vec<u8>> {
        self.nodes.raw_bytes(id)
    }

    fn node_size(&self, id: NodeId) -> StoreResult<u64> {
        self.nodes.size_of(id)
    }

    fn delete_nodes_batch(&self, batch: &mut WriteBatch, ids: &[NodeId]) -> StoreResult<()> {
        self.nodes.delete_batch(batch, ids)
    }

    fn restore_node_batch(&self, batch: &mut WriteBatch, id: NodeId, bytes: &[u8]) -> StoreResult<()> {
        self.nodes.write_raw_batch(batch, id, bytes)
    }

    fn latest_roots(&self, n: usize) -> StoreResult<Vec<(u64, NodeId)>> {
        self.roots.latest(n)
    }

    fn root_at(&self, tx_order: u64) -> StoreResult<Option<NodeId>> {
        self.roots.root_at(tx_order)
    }

    fn stale_before(&self, from: u64, cutoff: u64, limit: usize) -> StoreResult<Vec<StaleEntry>> {
        self.stale.range(from, cutoff, limit)
    }

    fn stale_after(&self, after: StaleEntry, cutoff: u64, limit: usize) -> StoreResult<Vec<StaleEntry>> {
        self.stale.range_after(after, cutoff, limit)
    }

    fn delete_stale_batch(&self, batch: &mut WriteBatch, entries: &[StaleEntry]) -> StoreResult<()> {
        self.stale.delete_batch(batch, entries)
    }

    fn write_batch(&self, batch: WriteBatch) -> StoreResult<()> {
        Ok(self.db.write(batch)?)
    }

    fn disk_usage(&self) -> StoreResult<u64> {
        let live = self.db.property_int_value("rocksdb.live-sst-files-size")?;
        let memtables = self.db.property_int_value("rocksdb.cur-size-all-mem-tables")?;
        match (live, memtables) {
            (Some(live), Some(memtables)) if live + memtables > 0 => Ok(live + memtables),
            _ => Ok(Self::directory_size(self.db.path())?),
        }
    }

    fn estimated_node_count(&self) -> Option<u64> {
        // The estimate covers every prefix, which only ever overshoots the node count
        self.db.property_int_value("rocksdb.estimate-num-keys").ok().flatten().filter(|&n| n > 0)
    }

    fn chain_id(&self) -> StoreResult<Option<u64>> {
        self.identity.read().get()
    }

    fn compact(&self) {
        self.db.compact_range(None::<&[u8]>, None::<&[u8]>);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vstate_database::{create_temp_db, prelude::ConnBuilder};

    #[test]
    fn test_commit_and_lookups() {
        let (_lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        let store = StateStore::init(db.clone(), 7).unwrap();
        assert_eq!(store.chain_id().unwrap(), Some(7));

        let leaf = StateNode::leaf(b"v1".to_vec());
        let root = StateNode::new(vec![leaf.id()], vec![]);
        store.commit(1, root.id(), &[leaf.clone(), root.clone()], &[]).unwrap();

        let leaf2 = StateNode::leaf(b"v2".to_vec());
        let root2 = StateNode::new(vec![leaf2.id()], vec![]);
        // Re-inserting `leaf` is tolerated
        store.commit(2, root2.id(), &[leaf2.clone(), root2.clone(), leaf.clone()], &[leaf.id(), root.id()]).unwrap();

        assert_eq!(store.latest_roots(5).unwrap(), vec![(2, root2.id()), (1, root.id())]);
        assert_eq!(store.root_at(1).unwrap(), Some(root.id()));
        assert_eq!(store.root_at(9).unwrap(), None);
        assert_eq!(store.children(root2.id()).unwrap(), vec![leaf2.id()]);
        assert_eq!(store.node_bytes(leaf.id()).unwrap(), leaf.to_bytes());
        assert_eq!(store.node_size(leaf.id()).unwrap(), leaf.to_bytes().len() as u64);
        assert_eq!(store.stale_before(0, 3, 10).unwrap().len(), 2);
        assert_eq!(store.node_ids_after(None, 100).unwrap().len(), 4);
        assert!(store.disk_usage().unwrap() > 0);

        // Duplicate roots are rejected
        assert!(store.commit(2, root2.id(), &[], &[]).is_err());
    }

    #[test]
    fn test_chain_identity_is_sticky() {
        let (_lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        drop(StateStore::init(db.clone(), 1).unwrap());
        assert!(StateStore::init(db.clone(), 1).is_ok());
        assert!(matches!(StateStore::init(db.clone(), 2), Err(StoreError::DataInconsistency(_))));
        assert_eq!(StateStore::new(db.clone()).chain_id().unwrap(), Some(1));
    }

    #[test]
    fn test_restore_raw_bytes() {
        let (_lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        let store = StateStore::init(db.clone(), 1).unwrap();
        let leaf = StateNode::leaf(b"gone".to_vec());
        store.commit(1, leaf.id(), &[leaf.clone()], &[]).unwrap();

        let bytes = store.node_bytes(leaf.id()).unwrap();
        let mut batch = WriteBatch::default();
        store.delete_nodes_batch(&mut batch, &[leaf.id()]).unwrap();
        store.write_batch(batch).unwrap();
        assert!(!store.has_node(leaf.id()).unwrap());

        let mut batch = WriteBatch::default();
        store.restore_node_batch(&mut batch, leaf.id(), &bytes).unwrap();
        store.write_batch(batch).unwrap();
        assert_eq!(store.get_node(leaf.id()).unwrap(), leaf);
    }
}
