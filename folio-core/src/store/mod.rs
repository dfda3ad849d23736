//! Key-value blob storage behind the artefact cache.

pub mod artefact;
pub mod disk;
pub mod memory;

pub use artefact::{ArtefactCache, ArtefactKey, ArtefactTier};
pub use disk::DiskStore;
pub use memory::MemoryStore;

use crate::config::{CacheBackend, CacheConfig};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("Disk cache requires a path")]
    MissingPath,
}

/// Opaque blob storage keyed by string.
///
/// Implementations must tolerate concurrent callers. Nothing stored here is
/// authoritative, so callers are free to treat any error as absence.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &str, blob: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

pub fn open_store(config: &CacheConfig) -> Result<Arc<dyn BlobStore>, StoreError> {
    match config.backend {
        CacheBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        CacheBackend::Disk => {
            let path = config.path.as_ref().ok_or(StoreError::MissingPath)?;
            Ok(Arc::new(DiskStore::open(path)?))
        }
    }
}
