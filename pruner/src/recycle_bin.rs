use crate::{
    config::DiskSpaceThresholds,
    errors::{PruneError, PruneResult},
};
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use sysinfo::Disks;
use vstate_core::{debug, error, info, warn};
use vstate_database::{
    prelude::{BatchDbWriter, CachePolicy, CachedDbAccess, StoreError, StoreResult, DB},
    registry::DatabaseStorePrefixes,
};
use vstate_hashes::Hash;
use vstate_store::{NodeId, PrunableStore};

pub const DEFAULT_LIST_LIMIT: usize = 100;
const PURGE_CHUNK: usize = 1000;

/// A soft-deleted node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecycleRecord {
    pub bytes: Vec<u8>,
    /// Unix millis
    pub created_at: u64,
    /// The cutoff tx order in force when the node was deleted
    pub tx_order: u64,
    pub original_size: u64,
}

impl RecycleRecord {
    pub fn new(bytes: Vec<u8>, created_at: u64, tx_order: u64) -> Self {
        let original_size = bytes.len() as u64;
        Self { bytes, created_at, tx_order, original_size }
    }
}

/// Selects recycle bin entries. All bounds are optional and combine with AND.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecycleFilter {
    /// Matches entries created strictly before this unix millis timestamp
    pub older_than: Option<u64>,
    /// Matches entries created strictly after this unix millis timestamp
    pub newer_than: Option<u64>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
}

impl RecycleFilter {
    pub fn matches(&self, record: &RecycleRecord) -> bool {
        self.older_than.is_none_or(|t| record.created_at < t)
            && self.newer_than.is_none_or(|t| record.created_at > t)
            && self.min_size.is_none_or(|s| record.original_size >= s)
            && self.max_size.is_none_or(|s| record.original_size <= s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecycleEntry {
    pub id: NodeId,
    pub record: RecycleRecord,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecycleListPage {
    pub entries: Vec<RecycleEntry>,
    /// Pass back to continue listing, `None` once all matching entries were returned
    pub next_cursor: Option<NodeId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecycleBinStats {
    pub entries: u64,
    pub total_bytes: u64,
    pub oldest_created_at: Option<u64>,
    pub newest_created_at: Option<u64>,
}

#[derive(Clone)]
pub struct RecycleBinStore {
    db: Arc<DB>,
    access: CachedDbAccess<NodeId, RecycleRecord>,
}

impl RecycleBinStore {
    pub fn new(db: Arc<DB>) -> Self {
        Self { access: CachedDbAccess::new(db.clone(), CachePolicy::Empty, DatabaseStorePrefixes::RecycleBin.into()), db }
    }

    pub fn put_batch(&self, batch: &mut WriteBatch, id: NodeId, record: RecycleRecord) -> StoreResult<()> {
        self.access.write(BatchDbWriter::new(batch), id, record)
    }

    pub fn get(&self, id: NodeId) -> StoreResult<RecycleRecord> {
        self.access.read(id)
    }

    /// Calls `f` for each entry after `cursor`, in key order, until it returns `false`
    fn scan<F>(&self, cursor: Option<NodeId>, mut f: F) -> StoreResult<()>
    where
        F: FnMut(NodeId, RecycleRecord) -> bool,
    {
        let skip_first = cursor.is_some();
        for item in self.access.seek_iterator(None, cursor, usize::MAX, skip_first) {
            let (key, record) = item.map_err(|err| StoreError::DataInconsistency(err.to_string()))?;
            let id = Hash::try_from_slice(&key)
                .ok_or_else(|| StoreError::DataInconsistency(format!("malformed recycle bin key of {} bytes", key.len())))?;
            if !f(id, record) {
                break;
            }
        }
        Ok(())
    }

    pub fn list(&self, filter: &RecycleFilter, cursor: Option<NodeId>, limit: usize) -> StoreResult<RecycleListPage> {
        let limit = if limit == 0 { DEFAULT_LIST_LIMIT } else { limit };
        let mut page = RecycleListPage::default();
        let mut has_more = false;
        self.scan(cursor, |id, record| {
            if !filter.matches(&record) {
                return true;
            }
            if page.entries.len() == limit {
                has_more = true;
                return false;
            }
            page.entries.push(RecycleEntry { id, record });
            true
        })?;
        if has_more {
            page.next_cursor = page.entries.last().map(|e| e.id);
        }
        Ok(page)
    }

    pub fn stats(&self) -> StoreResult<RecycleBinStats> {
        let mut stats = RecycleBinStats::default();
        self.scan(None, |_, record| {
            stats.entries += 1;
            stats.total_bytes += record.original_size;
            stats.oldest_created_at = Some(stats.oldest_created_at.map_or(record.created_at, |t| t.min(record.created_at)));
            stats.newest_created_at = Some(stats.newest_created_at.map_or(record.created_at, |t| t.max(record.created_at)));
            true
        })?;
        Ok(stats)
    }

    /// Moves an entry back into the node store. Both writes commit together.
    pub fn restore<S: PrunableStore + ?Sized>(&self, store: &S, id: NodeId) -> PruneResult<()> {
        let record = self.get(id)?;
        let mut batch = WriteBatch::default();
        store.restore_node_batch(&mut batch, id, &record.bytes)?;
        self.access.delete(BatchDbWriter::new(&mut batch), id)?;
        store.write_batch(batch)?;
        info!("Restored node {} ({} bytes) from the recycle bin", id, record.original_size);
        Ok(())
    }

    /// Permanently removes every entry matching `filter` and returns how many were removed
    pub fn purge(&self, filter: &RecycleFilter) -> StoreResult<u64> {
        let mut purged = 0u64;
        let mut cursor = None;
        loop {
            let mut chunk = Vec::with_capacity(PURGE_CHUNK);
            let mut last = None;
            self.scan(cursor, |id, record| {
                last = Some(id);
                if filter.matches(&record) {
                    chunk.push(id);
                }
                chunk.len() < PURGE_CHUNK
            })?;
            if !chunk.is_empty() {
                let mut batch = WriteBatch::default();
                self.access.delete_many(BatchDbWriter::new(&mut batch), &mut chunk.iter().copied())?;
                self.db.write(batch)?;
                purged += chunk.len() as u64;
            }
            if chunk.len() < PURGE_CHUNK {
                break;
            }
            cursor = last;
        }
        debug!("Purged {} recycle bin entries", purged);
        Ok(purged)
    }

    /// Purges entries older than the grace period, as of `now` (unix millis)
    pub fn purge_expired(&self, grace_period_secs: u64, now: u64) -> StoreResult<u64> {
        let older_than = now.saturating_sub(grace_period_secs.saturating_mul(1000));
        self.purge(&RecycleFilter { older_than: Some(older_than), ..Default::default() })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskSpaceStatus {
    Ok,
    Warning,
    Critical,
    /// No more recycle records may be written
    Stop,
}

impl DiskSpaceStatus {
    pub fn classify(available_pct: u64, thresholds: &DiskSpaceThresholds) -> Self {
        if available_pct <= thresholds.stop_pct {
            Self::Stop
        } else if available_pct <= thresholds.critical_pct {
            Self::Critical
        } else if available_pct <= thresholds.warning_pct {
            Self::Warning
        } else {
            Self::Ok
        }
    }
}

/// Reports `(total, available)` bytes of the disk holding a path
pub type DiskSpaceLookup = fn(&Path) -> Option<(u64, u64)>;

/// Reads the disk whose mount point is the longest prefix of `path`
pub fn system_disk_space(path: &Path) -> Option<(u64, u64)> {
    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| (disk.total_space(), disk.available_space()))
}

/// Checks free space on the database disk before recycle records are staged
#[derive(Clone, Debug)]
pub struct DiskSpaceGuard {
    thresholds: DiskSpaceThresholds,
    path: PathBuf,
    lookup: DiskSpaceLookup,
}

impl DiskSpaceGuard {
    pub fn new(thresholds: DiskSpaceThresholds, path: impl Into<PathBuf>) -> Self {
        Self { thresholds, path: path.into(), lookup: system_disk_space }
    }

    /// A guard for the disk of `db`, or `None` when the thresholds are disabled
    pub fn for_db(thresholds: DiskSpaceThresholds, db: &DB) -> Option<Self> {
        thresholds.enabled.then(|| Self::new(thresholds, db.path()))
    }

    pub fn with_lookup(self, lookup: DiskSpaceLookup) -> Self {
        Self { lookup, ..self }
    }

    /// Logs low space and fails at [`DiskSpaceStatus::Stop`]. Space which cannot be determined counts as adequate.
    pub fn check(&self) -> PruneResult<DiskSpaceStatus> {
        let Some((total, available)) = (self.lookup)(&self.path).filter(|&(total, _)| total > 0) else {
            debug!("Free space of {} is unknown, skipping the recycle bin disk check", self.path.display());
            return Ok(DiskSpaceStatus::Ok);
        };
        let available_pct = (available as u128 * 100 / total as u128) as u64;
        let status = DiskSpaceStatus::classify(available_pct, &self.thresholds);
        match status {
            DiskSpaceStatus::Ok => {}
            DiskSpaceStatus::Warning => {
                warn!("Disk space low: {}% of {} bytes available at {}", available_pct, total, self.path.display())
            }
            DiskSpaceStatus::Critical => error!(
                "Disk space critical: {}% of {} bytes available at {}, purge the recycle bin",
                available_pct,
                total,
                self.path.display()
            ),
            DiskSpaceStatus::Stop => {
                let err = PruneError::DiskSpaceExhausted { available_pct, path: self.path.display().to_string() };
                error!("{}", err);
                return Err(err);
            }
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestChain;
    use vstate_database::{
        create_temp_db,
        prelude::{ConnBuilder, StoreResultExt},
    };
    use vstate_store::StateNode;

    fn put(bin: &RecycleBinStore, db: &DB, id: NodeId, size: usize, created_at: u64) {
        let mut batch = WriteBatch::default();
        bin.put_batch(&mut batch, id, RecycleRecord::new(vec![7; size], created_at, 1)).unwrap();
        db.write(batch).unwrap();
    }

    #[test]
    fn test_filter_matching() {
        let record = RecycleRecord::new(vec![0; 100], 5_000, 3);
        assert!(RecycleFilter::default().matches(&record));
        assert!(RecycleFilter { older_than: Some(6_000), ..Default::default() }.matches(&record));
        assert!(!RecycleFilter { older_than: Some(5_000), ..Default::default() }.matches(&record));
        assert!(RecycleFilter { newer_than: Some(4_999), max_size: Some(100), ..Default::default() }.matches(&record));
        assert!(!RecycleFilter { min_size: Some(101), ..Default::default() }.matches(&record));
    }

    #[test]
    fn test_disk_space_classification() {
        let thresholds = DiskSpaceThresholds::default();
        assert_eq!(DiskSpaceStatus::classify(50, &thresholds), DiskSpaceStatus::Ok);
        assert_eq!(DiskSpaceStatus::classify(20, &thresholds), DiskSpaceStatus::Warning);
        assert_eq!(DiskSpaceStatus::classify(10, &thresholds), DiskSpaceStatus::Critical);
        assert_eq!(DiskSpaceStatus::classify(6, &thresholds), DiskSpaceStatus::Critical);
        assert_eq!(DiskSpaceStatus::classify(5, &thresholds), DiskSpaceStatus::Stop);
        assert_eq!(DiskSpaceStatus::classify(0, &thresholds), DiskSpaceStatus::Stop);
    }

    #[test]
    fn test_disk_space_guard() {
        let guard = DiskSpaceGuard::new(DiskSpaceThresholds::default(), "/data");
        assert_eq!(guard.clone().with_lookup(|_| Some((1000, 900))).check().unwrap(), DiskSpaceStatus::Ok);
        assert_eq!(guard.clone().with_lookup(|_| Some((1000, 150))).check().unwrap(), DiskSpaceStatus::Warning);
        assert!(matches!(
            guard.clone().with_lookup(|_| Some((1000, 40))).check(),
            Err(PruneError::DiskSpaceExhausted { available_pct: 4, .. })
        ));
        // Unknown or bogus readings never block
        assert_eq!(guard.clone().with_lookup(|_| None).check().unwrap(), DiskSpaceStatus::Ok);
        assert_eq!(guard.with_lookup(|_| Some((0, 0))).check().unwrap(), DiskSpaceStatus::Ok);

        let (_lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        let disabled = DiskSpaceThresholds { enabled: false, ..Default::default() };
        assert!(DiskSpaceGuard::for_db(disabled, &db).is_none());
        assert!(DiskSpaceGuard::for_db(DiskSpaceThresholds::default(), &db).is_some());
    }

    #[test]
    fn test_list_pages_and_stats() {
        let chain = TestChain::new();
        let db = chain.store.db().clone();
        let bin = RecycleBinStore::new(db.clone());
        for i in 1..=25u64 {
            put(&bin, &db, Hash::from_u64_word(i), (i * 10) as usize, i * 1000);
        }

        let large = RecycleFilter { min_size: Some(100), ..Default::default() };
        let first = bin.list(&large, None, 10).unwrap();
        assert_eq!(first.entries.len(), 10);
        assert_eq!(first.entries[0].id, Hash::from_u64_word(10));
        let second = bin.list(&large, first.next_cursor, 10).unwrap();
        assert_eq!(second.entries.len(), 6);
        assert_eq!(second.next_cursor, None);

        assert_eq!(bin.list(&RecycleFilter::default(), None, 0).unwrap().entries.len(), 25);

        let stats = bin.stats().unwrap();
        assert_eq!(stats.entries, 25);
        assert_eq!(stats.total_bytes, (1..=25u64).map(|i| i * 10).sum::<u64>());
        assert_eq!(stats.oldest_created_at, Some(1000));
        assert_eq!(stats.newest_created_at, Some(25_000));
        drop(db);
    }

    #[test]
    fn test_restore_and_purge() {
        let mut chain = TestChain::new();
        chain.populate(3);
        let store = chain.store.clone();
        let bin = RecycleBinStore::new(store.db().clone());

        let gone = StateNode::leaf(b"recycled".to_vec());
        let mut batch = WriteBatch::default();
        bin.put_batch(&mut batch, gone.id(), RecycleRecord::new(gone.to_bytes(), 10, 2)).unwrap();
        store.write_batch(batch).unwrap();

        bin.restore(store.as_ref(), gone.id()).unwrap();
        assert_eq!(store.get_node(gone.id()).unwrap(), gone);
        assert!(bin.get(gone.id()).optional().unwrap().is_none());
        assert!(matches!(bin.restore(store.as_ref(), gone.id()), Err(crate::errors::PruneError::StorageIo(StoreError::KeyNotFound(_)))));

        let db = store.db().clone();
        for i in 1..=2500u64 {
            put(&bin, &db, Hash::from_u64_word(i), 4, if i % 2 == 0 { 1_000 } else { 900_000 });
        }
        // Grace period of 100s as of t=1000s keeps only the recent half
        assert_eq!(bin.purge_expired(100, 1_000_000).unwrap(), 1250);
        assert_eq!(bin.stats().unwrap().entries, 1250);
        assert_eq!(bin.purge(&RecycleFilter::default()).unwrap(), 1250);
        assert_eq!(bin.stats().unwrap().entries, 0);
        drop(db);
        drop(store);
    }
}
