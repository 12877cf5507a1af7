// cvm-store/src/db.rs

use crate::{StoreError, StoreResult};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: String,
    pub create_if_missing: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
    pub max_write_buffer_number: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "./cvm-data".to_string(),
            create_if_missing: true,
            max_open_files: 1024,
            write_buffer_size: 64 * 1024 * 1024, // 64 MB
            max_write_buffer_number: 3,
        }
    }
}

/// The single sorted byte-key store backing every CVM component
///
/// All records live in the default column family; record families are
/// separated by the key prefixes in [`crate::keys`]. Writes that belong to
/// one externally observable event go through an [`AtomicBatch`].
pub struct KvStore {
    db: Arc<DB>,
}

impl KvStore {
    /// Open or create the store
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(config.create_if_missing);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.increase_parallelism(num_cpus::get() as i32);

        let db = DB::open(&opts, &config.path)
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        tracing::info!("CVM store opened at {}", config.path);

        Ok(Self { db: Arc::new(db) })
    }

    /// Open with defaults at the given path
    pub fn open_at<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::open(StoreConfig {
            path: path.as_ref().to_string_lossy().into_owned(),
            ..Default::default()
        })
    }

    /// Store a value under a key
    pub fn put<T: Serialize>(&self, key: &[u8], value: &T) -> StoreResult<()> {
        let bytes = bincode::serialize(value)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.db
            .put(key, bytes)
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    /// Get a value by key
    pub fn get<T: DeserializeOwned>(&self, key: &[u8]) -> StoreResult<Option<T>> {
        match self
            .db
            .get(key)
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?
        {
            Some(bytes) => {
                let value = bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::SerializationError(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Check for key presence without decoding
    pub fn exists(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self
            .db
            .get(key)
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?
            .is_some())
    }

    /// Delete a key
    pub fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.db
            .delete(key)
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    /// List all `(key, value)` pairs under a prefix
    pub fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut results = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_vec(), value.to_vec()));
        }

        Ok(results)
    }

    /// Decode every value under a prefix
    pub fn scan_prefix_values<T: DeserializeOwned>(&self, prefix: &[u8]) -> StoreResult<Vec<T>> {
        self.scan_prefix(prefix)?
            .into_iter()
            .map(|(_, bytes)| {
                bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::SerializationError(e.to_string()))
            })
            .collect()
    }

    /// Count keys under a prefix without decoding values
    pub fn count_prefix(&self, prefix: &[u8]) -> StoreResult<u64> {
        Ok(self.scan_prefix(prefix)?.len() as u64)
    }

    /// Start an atomic batch
    pub fn batch(&self) -> AtomicBatch<'_> {
        AtomicBatch {
            store: self,
            inner: WriteBatch::default(),
        }
    }
}

/// A write batch committed atomically; deletes are tombstones until commit
pub struct AtomicBatch<'a> {
    store: &'a KvStore,
    inner: WriteBatch,
}

impl AtomicBatch<'_> {
    pub fn put<T: Serialize>(&mut self, key: &[u8], value: &T) -> StoreResult<()> {
        let bytes = bincode::serialize(value)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.inner.put(key, bytes);
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.inner.delete(key);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Commit all staged writes; on error the store is unchanged
    pub fn commit(self) -> StoreResult<()> {
        self.store
            .db
            .write(self.inner)
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use cvm_crypto::{Address, Hash256};
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u64,
        label: String,
    }

    fn create_test_store() -> (KvStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::open_at(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (store, _temp) = create_test_store();

        let record = Record { id: 7, label: "edge".into() };
        let key = keys::bonded_vote_key(&Hash256::new([1u8; 32]));

        store.put(&key, &record).unwrap();
        let loaded: Record = store.get(&key).unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_missing_key_is_none() {
        let (store, _temp) = create_test_store();
        let loaded: Option<Record> = store.get(b"Zmissing").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_prefix_scan_stays_in_family() {
        let (store, _temp) = create_test_store();

        let from = Address::new([1u8; 20]);
        for i in 0..5u8 {
            let to = Address::new([i + 2; 20]);
            store
                .put(&keys::trust_edge_key(&from, &to), &Record { id: i as u64, label: "t".into() })
                .unwrap();
        }
        // A neighbouring family that must not leak into the scan
        store
            .put(&keys::bonded_vote_key(&Hash256::zero()), &Record { id: 99, label: "v".into() })
            .unwrap();

        let hits = store.scan_prefix(b"T").unwrap();
        assert_eq!(hits.len(), 5);
    }

    #[test]
    fn test_atomic_batch_commit() {
        let (store, _temp) = create_test_store();

        let k1 = keys::validator_stats_key(&Address::new([1u8; 20]));
        let k2 = keys::validator_stats_key(&Address::new([2u8; 20]));
        store.put(&k1, &Record { id: 1, label: "old".into() }).unwrap();

        let mut batch = store.batch();
        batch.put(&k2, &Record { id: 2, label: "new".into() }).unwrap();
        batch.delete(&k1);
        batch.commit().unwrap();

        assert!(!store.exists(&k1).unwrap());
        let loaded: Record = store.get(&k2).unwrap().unwrap();
        assert_eq!(loaded.id, 2);
    }

    #[test]
    fn test_count_prefix() {
        let (store, _temp) = create_test_store();

        for i in 0..3u64 {
            store.put(&keys::anomaly_alert_key(i), &Record { id: i, label: "a".into() }).unwrap();
        }
        assert_eq!(store.count_prefix(b"Z").unwrap(), 3);
    }
}
