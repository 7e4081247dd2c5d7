use crate::{cache::CachePolicy, db::DB, errors::StoreError};

use super::prelude::{Cache, DbKey, DbWriter};
use rocksdb::{Direction, IterateBounds, IteratorMode, ReadOptions};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::hash_map::RandomState, error::Error, hash::BuildHasher, sync::Arc};

/// A concurrent DB store access with typed caching.
#[derive(Clone)]
pub struct CachedDbAccess<TKey, TData, S = RandomState>
where
    TKey: Clone + std::hash::Hash + Eq + Send + Sync,
    TData: Clone + Send + Sync,
{
    db: Arc<DB>,

    // Cache
    cache: Cache<TKey, TData, S>,

    // DB bucket/path
    prefix: Vec<u8>,
}

pub type KeyDataResult<TData> = Result<(Box<[u8]>, TData), Box<dyn Error + Send + Sync>>;

impl<TKey, TData, S> CachedDbAccess<TKey, TData, S>
where
    TKey: Clone + std::hash::Hash + Eq + Send + Sync,
    TData: Clone + Send + Sync,
    S: BuildHasher + Default,
{
    pub fn new(db: Arc<DB>, cache_policy: CachePolicy, prefix: Vec<u8>) -> Self {
        Self { db, cache: Cache::new(cache_policy), prefix }
    }

    pub fn has(&self, key: TKey) -> Result<bool, StoreError>
    where
        TKey: AsRef<[u8]>,
    {
        Ok(self.cache.contains_key(&key) || self.db.get_pinned(DbKey::new(&self.prefix, key))?.is_some())
    }

    pub fn read(&self, key: TKey) -> Result<TData, StoreError>
    where
        TKey: AsRef<[u8]>,
        TData: DeserializeOwned, // We need `DeserializeOwned` since the slice coming from `db.get_pinned` has short lifetime
    {
        if let Some(data) = self.cache.get(&key) {
            Ok(data)
        } else {
            let db_key = DbKey::new(&self.prefix, key.clone());
            if let Some(slice) = self.db.get_pinned(&db_key)? {
                let data: TData = bincode::deserialize(&slice)?;
                self.cache.insert(key, data.clone());
                Ok(data)
            } else {
                Err(StoreError::KeyNotFound(db_key))
            }
        }
    }

    /// Returns the stored bytes of `key` without deserializing them
    pub fn read_raw(&self, key: TKey) -> Result<Vec<u8>, StoreError>
    where
        TKey: AsRef<[u8]>,
    {
        let db_key = DbKey::new(&self.prefix, key);
        match self.db.get_pinned(&db_key)? {
            Some(slice) => Ok(slice.to_vec()),
            None => Err(StoreError::KeyNotFound(db_key)),
        }
    }

    /// Returns the raw stored length of `key` without deserializing it
    pub fn read_len(&self, key: TKey) -> Result<usize, StoreError>
    where
        TKey: AsRef<[u8]>,
    {
        let db_key = DbKey::new(&self.prefix, key);
        match self.db.get_pinned(&db_key)? {
            Some(slice) => Ok(slice.len()),
            None => Err(StoreError::KeyNotFound(db_key)),
        }
    }

    pub fn iterator(&self) -> impl Iterator<Item = KeyDataResult<TData>> + '_
    where
        TKey: AsRef<[u8]>,
        TData: DeserializeOwned,
    {
        self.seek_iterator(None, None, usize::MAX, false)
    }

    pub fn write(&self, mut writer: impl DbWriter, key: TKey, data: TData) -> Result<(), StoreError>
    where
        TKey: AsRef<[u8]>,
        TData: Serialize,
    {
        let bin_data = bincode::serialize(&data)?;
        self.cache.insert(key.clone(), data);
        writer.put(DbKey::new(&self.prefix, key), bin_data)?;
        Ok(())
    }

    pub fn write_many(
        &self,
        mut writer: impl DbWriter,
        iter: &mut (impl Iterator<Item = (TKey, TData)> + Clone),
    ) -> Result<(), StoreError>
    where
        TKey: AsRef<[u8]>,
        TData: Serialize,
    {
        let iter_clone = iter.clone();
        self.cache.insert_many(iter);
        for (key, data) in iter_clone {
            let bin_data = bincode::serialize(&data)?;
            writer.put(DbKey::new(&self.prefix, key), bin_data)?;
        }
        Ok(())
    }

    pub fn delete(&self, mut writer: impl DbWriter, key: TKey) -> Result<(), StoreError>
    where
        TKey: AsRef<[u8]>,
    {
        self.cache.remove(&key);
        writer.delete(DbKey::new(&self.prefix, key))?;
        Ok(())
    }

    pub fn delete_many(&self, mut writer: impl DbWriter, key_iter: &mut (impl Iterator<Item = TKey> + Clone)) -> Result<(), StoreError>
    where
        TKey: AsRef<[u8]>,
    {
        let key_iter_clone = key_iter.clone();
        self.cache.remove_many(key_iter);
        for key in key_iter_clone {
            writer.delete(DbKey::new(&self.prefix, key))?;
        }
        Ok(())
    }

    /// Deletes all entries in the store using the underlying rocksdb `delete_range` operation
    pub fn delete_all(&self, mut writer: impl DbWriter) -> Result<(), StoreError> {
        self.cache.remove_all();
        let db_key = DbKey::prefix_only(&self.prefix);
        match rocksdb::PrefixRange(db_key.as_ref()).into_bounds() {
            (Some(from), Some(to)) => writer.delete_range(from, to)?,
            _ => return Err(StoreError::DataInconsistency(format!("prefix {db_key} has no upper bound"))),
        }
        Ok(())
    }

    /// A dynamic iterator over this store's prefix, optionally narrowed by a bucket and
    /// starting from `seek_from`. With `skip_first` the seek key itself is not yielded,
    /// which makes paging by "seek to last seen key" straightforward.
    pub fn seek_iterator(
        &self,
        bucket: Option<&[u8]>,
        seek_from: Option<TKey>,
        limit: usize,
        skip_first: bool,
    ) -> impl Iterator<Item = KeyDataResult<TData>> + '_
    where
        TKey: AsRef<[u8]>,
        TData: DeserializeOwned,
    {
        let db_key = bucket.map_or_else(
            move || DbKey::prefix_only(&self.prefix),
            move |bucket| {
                let mut key = DbKey::prefix_only(&self.prefix);
                key.add_bucket(bucket);
                key
            },
        );

        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_range(rocksdb::PrefixRange(db_key.as_ref()));

        let seek_key = seek_from.map(|key| DbKey::new(&self.prefix, key));
        let mut db_iterator = match &seek_key {
            Some(seek_key) => self.db.iterator_opt(IteratorMode::From(seek_key.as_ref(), Direction::Forward), read_opts),
            None => self.db.iterator_opt(IteratorMode::Start, read_opts),
        };

        // Only the seek key itself is skipped, so paging survives its deletion
        let mut skip = skip_first;
        std::iter::from_fn(move || {
            let item = db_iterator.next();
            if std::mem::take(&mut skip) {
                if let (Some(Ok((key, _))), Some(seek_key)) = (&item, &seek_key) {
                    if key.as_ref() == seek_key.as_ref() {
                        return db_iterator.next();
                    }
                }
            }
            item
        })
        .take(limit)
        .map(move |item| match item {
            Ok((key_bytes, value_bytes)) => match bincode::deserialize::<TData>(value_bytes.as_ref()) {
                Ok(value) => Ok((key_bytes[db_key.prefix_len()..].into(), value)),
                Err(err) => Err(err.into()),
            },
            Err(err) => Err(err.into()),
        })
    }

    /// Same paging contract as [`Self::seek_iterator`] but yields raw keys only, leaving values undecoded
    pub fn seek_keys(
        &self,
        seek_from: Option<TKey>,
        limit: usize,
        skip_first: bool,
    ) -> impl Iterator<Item = Result<Box<[u8]>, StoreError>> + '_
    where
        TKey: AsRef<[u8]>,
    {
        let db_key = DbKey::prefix_only(&self.prefix);
        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_range(rocksdb::PrefixRange(db_key.as_ref()));

        let seek_key = seek_from.map(|key| DbKey::new(&self.prefix, key));
        let mut db_iterator = match &seek_key {
            Some(seek_key) => self.db.iterator_opt(IteratorMode::From(seek_key.as_ref(), Direction::Forward), read_opts),
            None => self.db.iterator_opt(IteratorMode::Start, read_opts),
        };

        // Only the seek key itself is skipped, so paging survives its deletion
        let mut skip = skip_first;
        std::iter::from_fn(move || {
            let item = db_iterator.next();
            if std::mem::take(&mut skip) {
                if let (Some(Ok((key, _))), Some(seek_key)) = (&item, &seek_key) {
                    if key.as_ref() == seek_key.as_ref() {
                        return db_iterator.next();
                    }
                }
            }
            item
        })
        .take(limit)
        .map(move |item| match item {
            Ok((key_bytes, _)) => Ok(key_bytes[db_key.prefix_len()..].into()),
            Err(err) => Err(err.into()),
        })
    }

    /// Iterates this store's prefix from the highest key downwards
    pub fn reverse_iterator(&self, limit: usize) -> impl Iterator<Item = KeyDataResult<TData>> + '_
    where
        TData: DeserializeOwned,
    {
        let db_key = DbKey::prefix_only(&self.prefix);
        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_range(rocksdb::PrefixRange(db_key.as_ref()));
        self.db.iterator_opt(IteratorMode::End, read_opts).take(limit).map(move |item| match item {
            Ok((key_bytes, value_bytes)) => match bincode::deserialize::<TData>(value_bytes.as_ref()) {
                Ok(value) => Ok((key_bytes[db_key.prefix_len()..].into(), value)),
                Err(err) => Err(err.into()),
            },
            Err(err) => Err(err.into()),
        })
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        create_temp_db,
        prelude::{BatchDbWriter, ConnBuilder, DirectDbWriter},
    };
    use rocksdb::WriteBatch;
    use vstate_hashes::Hash;

    #[test]
    fn test_delete_all() {
        let (_lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        let access = CachedDbAccess::<Hash, u64>::new(db.clone(), CachePolicy::Count(2), vec![1, 2]);
        let neighbour = CachedDbAccess::<Hash, u64>::new(db.clone(), CachePolicy::Empty, vec![1, 3]);
        neighbour.write(DirectDbWriter::new(&db), 1.into(), 9).unwrap();

        access.write_many(DirectDbWriter::new(&db), &mut (0..16).map(|i| (i.into(), 2))).unwrap();
        assert_eq!(16, access.iterator().count());
        access.delete_all(DirectDbWriter::new(&db)).unwrap();
        assert_eq!(0, access.iterator().count());

        access.write_many(DirectDbWriter::new(&db), &mut (0..16).map(|i| (i.into(), 2))).unwrap();
        assert_eq!(16, access.iterator().count());
        let mut batch = WriteBatch::default();
        access.delete_all(BatchDbWriter::new(&mut batch)).unwrap();
        assert_eq!(16, access.iterator().count());
        db.write(batch).unwrap();
        assert_eq!(0, access.iterator().count());

        // Other prefixes are untouched
        assert_eq!(neighbour.read(1.into()).unwrap(), 9);
    }

    #[test]
    fn test_seek_iterator_paging() {
        let (_lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        let access = CachedDbAccess::<Hash, u64>::new(db.clone(), CachePolicy::Empty, vec![7]);
        access.write_many(DirectDbWriter::new(&db), &mut (1..=10u64).map(|i| (Hash::from_u64_word(i), i))).unwrap();

        let mut seen = Vec::new();
        let mut cursor: Option<Hash> = None;
        loop {
            let page: Vec<_> =
                access.seek_iterator(None, cursor, 3, cursor.is_some()).collect::<Result<Vec<_>, _>>().unwrap();
            if page.is_empty() {
                break;
            }
            cursor = Some(Hash::try_from_slice(&page.last().unwrap().0).unwrap());
            seen.extend(page.into_iter().map(|(_, v)| v));
        }
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_keys_and_reverse_iteration() {
        let (_lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        let access = CachedDbAccess::<Hash, u64>::new(db.clone(), CachePolicy::Empty, vec![4]);
        let upper = CachedDbAccess::<Hash, u64>::new(db.clone(), CachePolicy::Empty, vec![5]);
        access.write_many(DirectDbWriter::new(&db), &mut (1..=5u64).map(|i| (Hash::from_u64_word(i), i))).unwrap();
        upper.write(DirectDbWriter::new(&db), Hash::from_u64_word(100), 100).unwrap();

        let keys: Vec<_> = access.seek_keys(Some(Hash::from_u64_word(2)), 10, true).collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(Hash::try_from_slice(&keys[0]), Some(Hash::from_u64_word(3)));

        // Paging continues correctly when the last seen key was deleted in between
        access.delete(DirectDbWriter::new(&db), Hash::from_u64_word(2)).unwrap();
        let keys: Vec<_> = access.seek_keys(Some(Hash::from_u64_word(2)), 10, true).collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(Hash::try_from_slice(&keys[0]), Some(Hash::from_u64_word(3)));

        // Reverse iteration must stay inside the prefix even though a higher prefix exists
        let latest: Vec<u64> = access.reverse_iterator(2).map(|r| r.unwrap().1).collect();
        assert_eq!(latest, vec![5, 4]);
    }

    #[test]
    fn test_read_missing_and_len() {
        let (_lifetime, db) = create_temp_db!(ConnBuilder::default().with_files_limit(10));
        let access = CachedDbAccess::<Hash, Vec<u8>>::new(db.clone(), CachePolicy::Count(4), vec![9]);
        let key = Hash::from_u64_word(5);
        assert!(matches!(access.read(key), Err(StoreError::KeyNotFound(_))));
        assert!(!access.has(key).unwrap());

        access.write(DirectDbWriter::new(&db), key, vec![1, 2, 3]).unwrap();
        assert!(access.has(key).unwrap());
        // bincode length prefix (8 bytes) plus payload
        assert_eq!(access.read_len(key).unwrap(), 11);
        assert_eq!(access.read_raw(key).unwrap(), bincode::serialize(&vec![1u8, 2, 3]).unwrap());

        access.delete(DirectDbWriter::new(&db), key).unwrap();
        assert!(!access.has(key).unwrap());
    }
}
