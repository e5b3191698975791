//! In-memory storage backend.
//!
//! The reference [`WalletStorage`] implementation: a `BTreeMap` with the
//! same batch-atomicity contract a disk backend provides. Also the
//! backing store used by tests.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::error::{StorageError, StorageResult};
use crate::storage::{BatchOp, WalletStorage, WriteBatch};

/// In-memory ordered key/value store.
#[derive(Default)]
pub struct MemoryStorage {
    records: BTreeMap<Vec<u8>, Vec<u8>>,
    write_count: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl WalletStorage for MemoryStorage {
    fn read(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.records.get(key).cloned())
    }

    fn write_batch(&mut self, batch: WriteBatch) -> StorageResult<()> {
        // All ops are in-memory map mutations that cannot fail part way,
        // so applying in order is atomic enough here; a disk backend
        // stages to a journal first.
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => {
                    self.records.insert(key, value);
                }
                BatchOp::Erase(key) => {
                    self.records.remove(&key);
                }
            }
            self.write_count += 1;
        }
        Ok(())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .records
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn backup(&self, dest: &Path) -> StorageResult<()> {
        let mut file = std::fs::File::create(dest)
            .map_err(|e| StorageError::WriteFailed(format!("create {}: {}", dest.display(), e)))?;
        for (key, value) in &self.records {
            let mut record = Vec::with_capacity(8 + key.len() + value.len());
            record.extend_from_slice(&(key.len() as u32).to_le_bytes());
            record.extend_from_slice(key);
            record.extend_from_slice(&(value.len() as u32).to_le_bytes());
            record.extend_from_slice(value);
            file.write_all(&record)?;
        }
        file.sync_all()?;
        Ok(())
    }

    fn write_count(&self) -> u64 {
        self.write_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{erase_record, put_record};

    #[test]
    fn test_batch_and_prefix_iteration() {
        let mut storage = MemoryStorage::new();
        let mut batch = WriteBatch::new();
        batch.put(b"tx\x01".to_vec(), b"a".to_vec());
        batch.put(b"tx\x02".to_vec(), b"b".to_vec());
        batch.put(b"pool\x01".to_vec(), b"c".to_vec());
        storage.write_batch(batch).unwrap();

        let txs = storage.iter_prefix(b"tx").unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].1, b"a");
        assert_eq!(storage.write_count(), 3);
    }

    #[test]
    fn test_put_and_erase() {
        let mut storage = MemoryStorage::new();
        put_record(&mut storage, b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(storage.read(b"k").unwrap(), Some(b"v".to_vec()));
        erase_record(&mut storage, b"k".to_vec()).unwrap();
        assert_eq!(storage.read(b"k").unwrap(), None);
    }

    #[test]
    fn test_backup_writes_every_record() {
        let mut storage = MemoryStorage::new();
        put_record(&mut storage, b"key1".to_vec(), b"value1".to_vec()).unwrap();
        put_record(&mut storage, b"key2".to_vec(), b"value2".to_vec()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("wallet.bak");
        storage.backup(&dest).unwrap();

        let data = std::fs::read(&dest).unwrap();
        assert!(!data.is_empty());
        // 2 records of (4 + 4 + 4 + 6) bytes.
        assert_eq!(data.len(), 2 * (4 + 4 + 4 + 6));
    }
}
