use super::{BlobStore, StoreError};
use std::path::Path;

/// Persistent store backed by an embedded sled tree.
#[derive(Debug, Clone)]
pub struct DiskStore {
    db: sled::Db,
}

impl DiskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        log::debug!("Opened artefact store at {}", path.as_ref().display());
        Ok(Self { db })
    }

    /// Temporary store removed when the last handle drops.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn flush(&self) -> Result<usize, StoreError> {
        Ok(self.db.flush()?)
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

impl BlobStore for DiskStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key.as_bytes())?.map(|value| value.to_vec()))
    }

    fn put(&self, key: &str, blob: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key.as_bytes(), blob)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.db.clear()?;
        Ok(())
    }
}
