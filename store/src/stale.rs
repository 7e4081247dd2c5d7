use crate::{keys::StaleIndexKey, node::NodeId};
use rocksdb::WriteBatch;
use std::sync::Arc;
use vstate_database::{
    prelude::{BatchDbWriter, CachePolicy, CachedDbAccess, StoreError, StoreResult, DB},
    registry::DatabaseStorePrefixes,
};
use vstate_hashes::ZERO_HASH;

/// Records that the commit at `tx_order` stopped referencing `node`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StaleEntry {
    pub tx_order: u64,
    pub node: NodeId,
}

impl StaleEntry {
    pub fn new(tx_order: u64, node: NodeId) -> Self {
        Self { tx_order, node }
    }
}

impl From<StaleIndexKey> for StaleEntry {
    fn from(key: StaleIndexKey) -> Self {
        Self { tx_order: key.tx_order(), node: key.node() }
    }
}

impl From<StaleEntry> for StaleIndexKey {
    fn from(entry: StaleEntry) -> Self {
        StaleIndexKey::new(entry.tx_order, entry.node)
    }
}

#[derive(Clone)]
pub struct DbStaleIndexStore {
    access: CachedDbAccess<StaleIndexKey, ()>,
}

impl DbStaleIndexStore {
    pub fn new(db: Arc<DB>) -> Self {
        Self { access: CachedDbAccess::new(db, CachePolicy::Empty, DatabaseStorePrefixes::StaleIndex.into()) }
    }

    pub fn insert_batch(&self, batch: &mut WriteBatch, entry: StaleEntry) -> StoreResult<()> {
        self.access.write(BatchDbWriter::new(batch), entry.into(), ())
    }

    /// Entries with `from <= tx_order < cutoff`, in order, at most `limit` of them
    pub fn range(&self, from: u64, cutoff: u64, limit: usize) -> StoreResult<Vec<StaleEntry>> {
        if from >= cutoff {
            return Ok(Vec::new());
        }
        self.collect(StaleIndexKey::new(from, ZERO_HASH), false, cutoff, limit)
    }

    /// Entries strictly after `after` in key order and below `cutoff`. Paging through this
    /// does not depend on which of the already returned entries were deleted in between.
    pub fn range_after(&self, after: StaleEntry, cutoff: u64, limit: usize) -> StoreResult<Vec<StaleEntry>> {
        self.collect(after.into(), true, cutoff, limit)
    }

    fn collect(&self, seek: StaleIndexKey, skip_seek_key: bool, cutoff: u64, limit: usize) -> StoreResult<Vec<StaleEntry>> {
        let mut entries = Vec::new();
        for key in self.access.seek_keys(Some(seek), limit, skip_seek_key) {
            let key = key?;
            let key = StaleIndexKey::try_from_slice(&key)
                .ok_or_else(|| StoreError::DataInconsistency(format!("malformed stale index key of {} bytes", key.len())))?;
            if key.tx_order() >= cutoff {
                break;
            }
            entries.push(key.into());
        }
        Ok(entries)
    }

    pub fn delete_batch(&self, batch: &mut WriteBatch, entries: &[StaleEntry]) -> StoreResult<()> {
        self.access.delete_many(BatchDbWriter::new(batch), &mut entries.iter().map(|&e| e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vstate_database::{create_temp_db, prelude::ConnBuilder};
    use vstate_hashes::Hash;

    #[test]
    fn test_stale_range() {
        let (_lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        let store = DbStaleIndexStore::new(db.clone());
        let mut batch = WriteBatch::default();
        for order in 1..=6u64 {
            for w in 0..3u64 {
                store.insert_batch(&mut batch, StaleEntry::new(order, Hash::from_u64_word(order * 10 + w))).unwrap();
            }
        }
        db.write(batch).unwrap();

        let below_four = store.range(0, 4, 100).unwrap();
        assert_eq!(below_four.len(), 9);
        assert!(below_four.iter().all(|e| e.tx_order < 4));
        assert!(below_four.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(store.range(2, 4, 100).unwrap().len(), 6);
        assert_eq!(store.range(0, 7, 4).unwrap().len(), 4);
        assert!(store.range(5, 5, 100).unwrap().is_empty());

        let mut batch = WriteBatch::default();
        store.delete_batch(&mut batch, &below_four).unwrap();
        db.write(batch).unwrap();
        assert!(store.range(0, 4, 100).unwrap().is_empty());
        assert_eq!(store.range(0, u64::MAX, 100).unwrap().len(), 9);
    }

    #[test]
    fn test_range_after_pages_past_kept_entries() {
        let (_lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        let store = DbStaleIndexStore::new(db.clone());
        let mut batch = WriteBatch::default();
        // All entries share one order, so only the node id can move the cursor forward
        for w in 1..=10u64 {
            store.insert_batch(&mut batch, StaleEntry::new(3, Hash::from_u64_word(w))).unwrap();
        }
        db.write(batch).unwrap();

        let first = store.range(0, 4, 4).unwrap();
        assert_eq!(first.len(), 4);
        // Drop every other entry of the page, as a sweep keeping some nodes would
        let mut batch = WriteBatch::default();
        store.delete_batch(&mut batch, &[first[1], first[3]]).unwrap();
        db.write(batch).unwrap();

        let second = store.range_after(first[3], 4, 4).unwrap();
        assert_eq!(second.iter().map(|e| e.node).collect::<Vec<_>>(), (5..=8u64).map(Hash::from_u64_word).collect::<Vec<_>>());
        let third = store.range_after(second[3], 4, 4).unwrap();
        assert_eq!(third.len(), 2);
        assert!(store.range_after(third[1], 4, 4).unwrap().is_empty());
        assert!(store.range_after(first[0], 3, 4).unwrap().is_empty());
    }
}
