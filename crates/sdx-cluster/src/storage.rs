//! Storage driver contract and an in-memory driver.
//!
//! The on-disk engine is an external collaborator. The core only needs
//! point reads, prefix scans, patch merges and ordered batch application
//! over sibling sets, addressed by (bucket, site, key).

use crate::batch::UpdateBatch;
use crate::error::StorageError;
use parking_lot::RwLock;
use sdx_core::SiblingSet;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

/// One row returned by a prefix scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEntry {
    pub prefix: String,
    pub key: String,
    pub value: SiblingSet,
    pub local_version: u64,
}

pub trait StorageDriver: Send + Sync {
    /// Positional point reads. Missing keys read as empty sets.
    fn get(&self, bucket: &str, site_id: &str, keys: &[String])
        -> Result<Vec<SiblingSet>, StorageError>;

    /// Every stored key starting with one of `prefixes`, grouped by prefix
    /// in argument order and sorted by key inside a group.
    fn get_matches(
        &self,
        bucket: &str,
        site_id: &str,
        prefixes: &[String],
    ) -> Result<Vec<StoredEntry>, StorageError>;

    /// Merge each value of `patch` into the stored set of its key.
    fn merge(
        &self,
        bucket: &str,
        site_id: &str,
        patch: &HashMap<String, SiblingSet>,
    ) -> Result<(), StorageError>;

    /// Apply `batch` in order as writes by `node_id`, returning the stored
    /// set of every touched key afterwards.
    fn apply(
        &self,
        bucket: &str,
        site_id: &str,
        node_id: &str,
        batch: &UpdateBatch,
        timestamp: u64,
    ) -> Result<HashMap<String, SiblingSet>, StorageError>;
}

type RowKey = (String, String, String);

#[derive(Debug, Default)]
struct Rows {
    entries: BTreeMap<RowKey, (SiblingSet, u64)>,
    version: u64,
}

impl Rows {
    fn read(&self, bucket: &str, site_id: &str, key: &str) -> SiblingSet {
        self.entries
            .get(&row_key(bucket, site_id, key))
            .map(|(set, _)| set.clone())
            .unwrap_or_default()
    }

    fn store(&mut self, bucket: &str, site_id: &str, key: &str, set: SiblingSet) {
        self.version += 1;
        self.entries
            .insert(row_key(bucket, site_id, key), (set, self.version));
    }
}

/// Sibling sets held in a sorted map. Every stored row carries the local
/// version at which it last changed.
#[derive(Debug, Default)]
pub struct MemoryStorageDriver {
    rows: RwLock<Rows>,
    closed: AtomicBool,
}

impl MemoryStorageDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows across all buckets and sites.
    pub fn len(&self) -> usize {
        self.rows.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse every further operation with `StorageError::Closed`. Stored
    /// rows are kept.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl StorageDriver for MemoryStorageDriver {
    fn get(
        &self,
        bucket: &str,
        site_id: &str,
        keys: &[String],
    ) -> Result<Vec<SiblingSet>, StorageError> {
        self.ensure_open()?;
        let rows = self.rows.read();
        Ok(keys
            .iter()
            .map(|key| rows.read(bucket, site_id, key))
            .collect())
    }

    fn get_matches(
        &self,
        bucket: &str,
        site_id: &str,
        prefixes: &[String],
    ) -> Result<Vec<StoredEntry>, StorageError> {
        self.ensure_open()?;
        let rows = self.rows.read();
        let mut matches = Vec::new();

        for prefix in prefixes {
            let start = row_key(bucket, site_id, prefix);
            let scan = rows
                .entries
                .range((Bound::Included(start), Bound::Unbounded))
                .take_while(|((b, s, key), _)| b == bucket && s == site_id && key.starts_with(prefix.as_str()));

            for ((_, _, key), (value, local_version)) in scan {
                matches.push(StoredEntry {
                    prefix: prefix.clone(),
                    key: key.clone(),
                    value: value.clone(),
                    local_version: *local_version,
                });
            }
        }

        Ok(matches)
    }

    fn merge(
        &self,
        bucket: &str,
        site_id: &str,
        patch: &HashMap<String, SiblingSet>,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut rows = self.rows.write();
        for (key, incoming) in patch {
            let current = rows.read(bucket, site_id, key);
            let merged = current.merge(incoming);
            if merged != current {
                rows.store(bucket, site_id, key, merged);
            }
        }
        Ok(())
    }

    fn apply(
        &self,
        bucket: &str,
        site_id: &str,
        node_id: &str,
        batch: &UpdateBatch,
        timestamp: u64,
    ) -> Result<HashMap<String, SiblingSet>, StorageError> {
        self.ensure_open()?;
        let mut rows = self.rows.write();
        let mut touched = HashMap::new();

        for op in batch.ops() {
            let current = rows.read(bucket, site_id, op.key());
            let updated = current.event(node_id, timestamp, op.value().map(<[u8]>::to_vec));
            rows.store(bucket, site_id, op.key(), updated.clone());
            touched.insert(op.key().to_string(), updated);
        }

        Ok(touched)
    }
}

fn row_key(bucket: &str, site_id: &str, key: &str) -> RowKey {
    (bucket.to_string(), site_id.to_string(), key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_missing_keys_read_empty() {
        let storage = MemoryStorageDriver::new();
        let values = storage.get("default", "site1", &keys(&["a", "b"])).unwrap();
        assert_eq!(values, vec![SiblingSet::new(), SiblingSet::new()]);
    }

    #[test]
    fn test_apply_in_order() {
        let storage = MemoryStorageDriver::new();
        let mut batch = UpdateBatch::new();
        batch.put("k", "1").put("k", "2").put("other", "x");

        let touched = storage.apply("default", "site1", "1", &batch, 100).unwrap();
        assert_eq!(touched.len(), 2);
        assert_eq!(touched["k"].values(), vec![b"2".as_slice()]);

        let values = storage.get("default", "site1", &keys(&["k"])).unwrap();
        assert_eq!(values[0], touched["k"]);
    }

    #[test]
    fn test_buckets_and_sites_are_isolated() {
        let storage = MemoryStorageDriver::new();
        let mut batch = UpdateBatch::new();
        batch.put("k", "v");
        storage.apply("default", "site1", "1", &batch, 1).unwrap();

        assert!(storage.get("lww", "site1", &keys(&["k"])).unwrap()[0].is_empty());
        assert!(storage.get("default", "site2", &keys(&["k"])).unwrap()[0].is_empty());
    }

    #[test]
    fn test_get_matches_scans_prefixes() {
        let storage = MemoryStorageDriver::new();
        let mut batch = UpdateBatch::new();
        batch.put("user.2", "b").put("user.1", "a").put("group.1", "g");
        storage.apply("default", "site1", "1", &batch, 1).unwrap();

        let matches = storage
            .get_matches("default", "site1", &keys(&["user.", "group."]))
            .unwrap();
        let found: Vec<(&str, &str)> = matches
            .iter()
            .map(|e| (e.prefix.as_str(), e.key.as_str()))
            .collect();

        assert_eq!(
            found,
            vec![("user.", "user.1"), ("user.", "user.2"), ("group.", "group.1")]
        );
        assert!(matches.iter().all(|e| e.local_version > 0));
    }

    #[test]
    fn test_merge_only_bumps_version_on_change() {
        let storage = MemoryStorageDriver::new();
        let mut batch = UpdateBatch::new();
        batch.put("k", "v");
        let touched = storage.apply("default", "site1", "1", &batch, 1).unwrap();

        let before = storage.get_matches("default", "site1", &keys(&["k"])).unwrap();
        storage.merge("default", "site1", &touched).unwrap();
        let after = storage.get_matches("default", "site1", &keys(&["k"])).unwrap();

        assert_eq!(before[0].local_version, after[0].local_version);
    }

    #[test]
    fn test_closed_driver_refuses_operations() {
        let storage = MemoryStorageDriver::new();
        let mut batch = UpdateBatch::new();
        batch.put("k", "v");
        let touched = storage.apply("default", "site1", "1", &batch, 1).unwrap();

        storage.close();
        assert!(storage.is_closed());
        assert_eq!(storage.get("default", "site1", &keys(&["k"])), Err(StorageError::Closed));
        assert_eq!(
            storage.get_matches("default", "site1", &keys(&["k"])),
            Err(StorageError::Closed)
        );
        assert_eq!(storage.merge("default", "site1", &touched), Err(StorageError::Closed));
        assert_eq!(
            storage.apply("default", "site1", "1", &batch, 2),
            Err(StorageError::Closed)
        );
        assert_eq!(storage.len(), 1);
    }
}
