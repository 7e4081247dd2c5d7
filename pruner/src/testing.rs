//! Test fixtures: a small key/value state committed as a two-level tree, and a store wrapper with fault injection

use rocksdb::WriteBatch;
use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    ops::Range,
    sync::Arc,
};
use vstate_database::{
    create_temp_db,
    prelude::{ConnBuilder, StoreError, StoreResult, DB},
    registry::DatabaseStorePrefixes,
    utils::DbLifetime,
};
use vstate_store::{NodeId, PrunableStore, StaleEntry, StateNode, StateStore};

pub const TEST_CHAIN_ID: u64 = 42;
const BUCKETS: u32 = 8;

/// Keys are grouped into buckets under the root, so untouched buckets are shared between versions
pub struct TestChain {
    pub store: Arc<StateStore>,
    state: BTreeMap<u32, Vec<u8>>,
    live: HashSet<NodeId>,
    order: u64,
    db: Arc<DB>,
    // Declared last so it is dropped after every DB handle above
    _lifetime: DbLifetime,
}

impl TestChain {
    pub fn new() -> Self {
        let (lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        let store = Arc::new(StateStore::init(db.clone(), TEST_CHAIN_ID).unwrap());
        Self { store, state: BTreeMap::new(), live: HashSet::new(), order: 0, db, _lifetime: lifetime }
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn latest_root(&self) -> NodeId {
        self.store.latest_roots(1).unwrap()[0].1
    }

    /// Inserts keys `0..count`, one commit per key
    pub fn populate(&mut self, count: u32) {
        for key in 0..count {
            self.state.insert(key, format!("initial-{key}").into_bytes());
            self.commit();
        }
    }

    pub fn update_range(&mut self, keys: Range<u32>, value: &[u8]) {
        for key in keys {
            self.state.insert(key, [value, &key.to_be_bytes()].concat());
            self.commit();
        }
    }

    pub fn remove_range(&mut self, keys: Range<u32>) {
        for key in keys {
            self.state.remove(&key);
            self.commit();
        }
    }

    /// Commits a new root without changing any key
    pub fn touch(&mut self, times: usize) {
        for _ in 0..times {
            self.commit();
        }
    }

    fn build(&self, order: u64) -> (StateNode, Vec<StateNode>) {
        let mut buckets: BTreeMap<u32, Vec<NodeId>> = BTreeMap::new();
        let mut nodes = Vec::new();
        for (key, value) in self.state.iter() {
            let leaf = StateNode::leaf([&key.to_be_bytes()[..], value].concat());
            buckets.entry(key % BUCKETS).or_default().push(leaf.id());
            nodes.push(leaf);
        }
        let mut bucket_ids = Vec::new();
        for (bucket, children) in buckets {
            let node = StateNode::new(children, bucket.to_be_bytes().to_vec());
            bucket_ids.push(node.id());
            nodes.push(node);
        }
        let root = StateNode::new(bucket_ids, order.to_be_bytes().to_vec());
        nodes.push(root.clone());
        (root, nodes)
    }

    pub fn commit(&mut self) {
        let order = self.order + 1;
        let (root, nodes) = self.build(order);
        self.commit_raw(root, nodes);
    }

    /// Commits `root` with `nodes` as the complete new live set
    pub fn commit_raw(&mut self, root: StateNode, nodes: Vec<StateNode>) {
        self.order += 1;
        let next: HashSet<NodeId> = nodes.iter().map(|n| n.id()).collect();
        let fresh: Vec<StateNode> = nodes.into_iter().filter(|n| !self.live.contains(&n.id())).collect();
        let stale: Vec<NodeId> = self.live.difference(&next).copied().collect();
        self.store.commit(self.order, root.id(), &fresh, &stale).unwrap();
        self.live = next;
    }

    /// Overwrites a node with arbitrary bytes and reopens the store so no cached copy survives
    pub fn corrupt_node(&mut self, id: NodeId, bytes: &[u8]) {
        let key = [DatabaseStorePrefixes::Nodes.as_ref(), id.as_bytes().as_slice()].concat();
        self.db.put(key, bytes).unwrap();
        self.reopen();
    }

    pub fn reopen(&mut self) {
        self.store = Arc::new(StateStore::new(self.db.clone()));
    }

    /// Reachability computed independently of the pruner, over the same window semantics
    pub fn reference_reachable(&self, window: u64) -> HashSet<NodeId> {
        let roots = self.store.latest_roots(window.max(1) as usize).unwrap();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeId> = roots.into_iter().map(|(_, root)| root).collect();
        while let Some(id) = queue.pop_front() {
            if seen.insert(id) {
                if let Ok(children) = self.store.children(id) {
                    queue.extend(children);
                }
            }
        }
        seen
    }

    pub fn all_nodes(&self) -> Vec<NodeId> {
        self.store.node_ids_after(None, usize::MAX).unwrap()
    }

    pub fn node_count(&self) -> usize {
        self.all_nodes().len()
    }
}

/// Delegates to a [`StateStore`] but fails reads of poisoned nodes and, optionally, node iteration
pub struct FaultyStore {
    inner: Arc<StateStore>,
    poisoned: HashSet<NodeId>,
    fail_iteration: bool,
}

impl FaultyStore {
    pub fn new(inner: Arc<StateStore>, poisoned: impl IntoIterator<Item = NodeId>) -> Self {
        Self { inner, poisoned: poisoned.into_iter().collect(), fail_iteration: false }
    }

    pub fn failing_iteration(inner: Arc<StateStore>) -> Self {
        Self { inner, poisoned: HashSet::new(), fail_iteration: true }
    }

    fn check(&self, id: NodeId) -> StoreResult<()> {
        if self.poisoned.contains(&id) {
            return Err(StoreError::DataInconsistency(format!("injected fault reading {id}")));
        }
        Ok(())
    }
}

impl PrunableStore for FaultyStore {
    fn db(&self) -> &Arc<DB> {
        self.inner.db()
    }

    fn node_ids_after(&self, after: Option<NodeId>, limit: usize) -> StoreResult<Vec<NodeId>> {
        if self.fail_iteration {
            return Err(StoreError::DataInconsistency("injected iterator fault".to_string()));
        }
        self.inner.node_ids_after(after, limit)
    }

    fn children(&self, id: NodeId) -> StoreResult<Vec<NodeId>> {
        self.inner.children(id)
    }

    fn node_bytes(&self, id: NodeId) -> StoreResult<Vec<u8>> {
        self.check(id)?;
        self.inner.node_bytes(id)
    }

    fn node_size(&self, id: NodeId) -> StoreResult<u64> {
        self.check(id)?;
        self.inner.node_size(id)
    }

    fn delete_nodes_batch(&self, batch: &mut WriteBatch, ids: &[NodeId]) -> StoreResult<()> {
        self.inner.delete_nodes_batch(batch, ids)
    }

    fn restore_node_batch(&self, batch: &mut WriteBatch, id: NodeId, bytes: &[u8]) -> StoreResult<()> {
        self.inner.restore_node_batch(batch, id, bytes)
    }

    fn latest_roots(&self, n: usize) -> StoreResult<Vec<(u64, NodeId)>> {
        self.inner.latest_roots(n)
    }

    fn root_at(&self, tx_order: u64) -> StoreResult<Option<NodeId>> {
        self.inner.root_at(tx_order)
    }

    fn stale_before(&self, from: u64, cutoff: u64, limit: usize) -> StoreResult<Vec<StaleEntry>> {
        self.inner.stale_before(from, cutoff, limit)
    }

    fn stale_after(&self, after: StaleEntry, cutoff: u64, limit: usize) -> StoreResult<Vec<StaleEntry>> {
        self.inner.stale_after(after, cutoff, limit)
    }

    fn delete_stale_batch(&self, batch: &mut WriteBatch, entries: &[StaleEntry]) -> StoreResult<()> {
        self.inner.delete_stale_batch(batch, entries)
    }

    fn write_batch(&self, batch: WriteBatch) -> StoreResult<()> {
        self.inner.write_batch(batch)
    }

    fn disk_usage(&self) -> StoreResult<u64> {
        self.inner.disk_usage()
    }

    fn estimated_node_count(&self) -> Option<u64> {
        self.inner.estimated_node_count()
    }

    fn chain_id(&self) -> StoreResult<Option<u64>> {
        self.inner.chain_id()
    }

    fn compact(&self) {
        self.inner.compact()
    }
}
