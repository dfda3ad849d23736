use super::{BlobStore, StoreError};
use crate::core::derivation::TierVersions;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtefactTier {
    Working,
    Prepared,
    Normalized,
    Thumbnail,
}

impl ArtefactTier {
    pub const ALL: [ArtefactTier; 4] = [
        ArtefactTier::Working,
        ArtefactTier::Prepared,
        ArtefactTier::Normalized,
        ArtefactTier::Thumbnail,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            ArtefactTier::Working => "work",
            ArtefactTier::Prepared => "prep",
            ArtefactTier::Normalized => "norm",
            ArtefactTier::Thumbnail => "thumb",
        }
    }
}

impl fmt::Display for ArtefactTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// `<tier>::<contentHash>::<version>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtefactKey {
    pub tier: ArtefactTier,
    pub content_hash: String,
    pub version: String,
}

impl ArtefactKey {
    pub fn new(tier: ArtefactTier, content_hash: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            tier,
            content_hash: content_hash.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ArtefactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.tier, self.content_hash, self.version)
    }
}

/// Disposable cache of derived blobs.
///
/// Store failures never surface from `get`/`put`/`delete`: they are logged and
/// reported as absence, because every entry can be rebuilt from its parent.
#[derive(Clone)]
pub struct ArtefactCache {
    store: Arc<dyn BlobStore>,
    versions: TierVersions,
}

impl ArtefactCache {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self::with_versions(store, TierVersions::default())
    }

    pub fn with_versions(store: Arc<dyn BlobStore>, versions: TierVersions) -> Self {
        Self { store, versions }
    }

    pub fn version(&self, tier: ArtefactTier) -> &str {
        match tier {
            ArtefactTier::Working => &self.versions.working,
            ArtefactTier::Prepared => &self.versions.prepared,
            ArtefactTier::Normalized => &self.versions.normalized,
            ArtefactTier::Thumbnail => &self.versions.thumbnail,
        }
    }

    /// Key for the current build version of `tier`.
    pub fn key(&self, tier: ArtefactTier, content_hash: &str) -> ArtefactKey {
        ArtefactKey::new(tier, content_hash, self.version(tier))
    }

    pub fn get(&self, key: &ArtefactKey) -> Option<Vec<u8>> {
        match self.store.get(&key.to_string()) {
            Ok(blob) => blob,
            Err(e) => {
                log::warn!("Artefact read failed for {}: {}", key, e);
                None
            }
        }
    }

    pub fn put(&self, key: &ArtefactKey, blob: &[u8]) {
        if let Err(e) = self.store.put(&key.to_string(), blob) {
            log::warn!("Artefact write failed for {}: {}", key, e);
        }
    }

    pub fn delete(&self, key: &ArtefactKey) {
        if let Err(e) = self.store.delete(&key.to_string()) {
            log::warn!("Artefact delete failed for {}: {}", key, e);
        }
    }

    pub fn contains(&self, key: &ArtefactKey) -> bool {
        self.get(key).is_some()
    }

    /// Drops every artefact of every tier.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.clear()
    }
}

impl fmt::Debug for ArtefactCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtefactCache")
            .field("versions", &self.versions)
            .finish_non_exhaustive()
    }
}
