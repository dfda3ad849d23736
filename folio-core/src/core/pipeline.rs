//! Cache-aware derivation of the artefact tiers.
//!
//! Every method here treats the cache as disposable: a missing tier is
//! rebuilt from its parent, and only the working tier depends on the
//! original bytes.

use crate::core::profile::VisualProfile;
use crate::core::project::PreparationTicket;
use crate::core::worker::{ContentIdentity, PixelWorker, WorkerError};
use crate::models::ImagePreparation;
use crate::store::{ArtefactCache, ArtefactTier};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("Working image missing for {content_hash}")]
    WorkingMissing { content_hash: String },

    #[error("Preparation for {image_id} was superseded by a newer one")]
    Superseded { image_id: String },

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[derive(Debug)]
pub struct DerivationPipeline {
    cache: ArtefactCache,
    worker: PixelWorker,
    builds: HashMap<ArtefactTier, AtomicUsize>,
}

impl DerivationPipeline {
    pub fn new(cache: ArtefactCache, worker: PixelWorker) -> Self {
        let builds = ArtefactTier::ALL
            .into_iter()
            .map(|tier| (tier, AtomicUsize::new(0)))
            .collect();
        Self {
            cache,
            worker,
            builds,
        }
    }

    pub fn cache(&self) -> &ArtefactCache {
        &self.cache
    }

    pub fn worker(&self) -> &PixelWorker {
        &self.worker
    }

    /// How many times `tier` has actually been built (not served from cache).
    pub fn build_count(&self, tier: ArtefactTier) -> usize {
        self.builds
            .get(&tier)
            .map(|count| count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn record_build(&self, tier: ArtefactTier) {
        if let Some(count) = self.builds.get(&tier) {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn get(&self, tier: ArtefactTier, content_hash: &str) -> Option<Vec<u8>> {
        self.cache.get(&self.cache.key(tier, content_hash))
    }

    pub fn has(&self, tier: ArtefactTier, content_hash: &str) -> bool {
        self.cache.contains(&self.cache.key(tier, content_hash))
    }

    pub async fn identify(&self, original: Vec<u8>) -> Result<ContentIdentity, DerivationError> {
        Ok(self.worker.content_identity(original).await?)
    }

    /// Builds the working tier from original bytes unless it is already cached.
    pub async fn ensure_working(&self, content_hash: &str, original: Vec<u8>) -> Result<(), DerivationError> {
        let key = self.cache.key(ArtefactTier::Working, content_hash);
        if self.cache.contains(&key) {
            return Ok(());
        }

        let blob = self.worker.build_working(original).await?;
        self.record_build(ArtefactTier::Working);
        self.cache.put(&key, &blob);
        log::debug!("Built {}", key);
        Ok(())
    }

    pub fn working(&self, content_hash: &str) -> Result<Vec<u8>, DerivationError> {
        self.get(ArtefactTier::Working, content_hash)
            .ok_or_else(|| DerivationError::WorkingMissing {
                content_hash: content_hash.to_string(),
            })
    }

    /// Rebuilds the prepared tier from working, ignoring any cached entry.
    ///
    /// With a ticket, the result is only stored if the ticket is still
    /// current once the build finishes.
    pub async fn regenerate_prepared(
        &self,
        content_hash: &str,
        preparation: &ImagePreparation,
        ticket: Option<&PreparationTicket>,
    ) -> Result<Vec<u8>, DerivationError> {
        let working = self.working(content_hash)?;
        let blob = self.worker.build_prepared(working, *preparation).await?;
        self.record_build(ArtefactTier::Prepared);

        check_ticket(ticket)?;
        self.cache
            .put(&self.cache.key(ArtefactTier::Prepared, content_hash), &blob);
        Ok(blob)
    }

    pub async fn ensure_prepared(
        &self,
        content_hash: &str,
        preparation: &ImagePreparation,
    ) -> Result<Vec<u8>, DerivationError> {
        match self.get(ArtefactTier::Prepared, content_hash) {
            Some(blob) => Ok(blob),
            None => self.regenerate_prepared(content_hash, preparation, None).await,
        }
    }

    /// Rebuilds the canonical tier from prepared. A missing prepared entry is
    /// rebuilt once and the fresh bytes are used directly.
    pub async fn regenerate_canonical(
        &self,
        content_hash: &str,
        preparation: &ImagePreparation,
        ticket: Option<&PreparationTicket>,
    ) -> Result<Vec<u8>, DerivationError> {
        let prepared = match self.get(ArtefactTier::Prepared, content_hash) {
            Some(blob) => blob,
            None => {
                log::debug!("Prepared tier missing for {}, rebuilding", content_hash);
                self.regenerate_prepared(content_hash, preparation, ticket).await?
            }
        };

        let blob = self.worker.build_canonical(prepared).await?;
        self.record_build(ArtefactTier::Normalized);

        check_ticket(ticket)?;
        self.cache
            .put(&self.cache.key(ArtefactTier::Normalized, content_hash), &blob);
        Ok(blob)
    }

    pub async fn ensure_canonical(
        &self,
        content_hash: &str,
        preparation: &ImagePreparation,
    ) -> Result<Vec<u8>, DerivationError> {
        match self.get(ArtefactTier::Normalized, content_hash) {
            Some(blob) => Ok(blob),
            None => self.regenerate_canonical(content_hash, preparation, None).await,
        }
    }

    pub async fn ensure_thumbnail(&self, content_hash: &str) -> Result<Vec<u8>, DerivationError> {
        let key = self.cache.key(ArtefactTier::Thumbnail, content_hash);
        if let Some(blob) = self.cache.get(&key) {
            return Ok(blob);
        }

        let working = self.working(content_hash)?;
        let blob = self.worker.build_thumbnail(working).await?;
        self.record_build(ArtefactTier::Thumbnail);
        self.cache.put(&key, &blob);
        Ok(blob)
    }

    /// Drops the geometry-dependent tiers. Working and thumbnail survive.
    pub fn invalidate_prepared(&self, content_hash: &str) {
        self.cache
            .delete(&self.cache.key(ArtefactTier::Prepared, content_hash));
        self.cache
            .delete(&self.cache.key(ArtefactTier::Normalized, content_hash));
    }

    /// Average hash of the cached canonical tier, or `None` if it is absent.
    pub async fn perceptual_hash(&self, content_hash: &str) -> Result<Option<String>, DerivationError> {
        match self.get(ArtefactTier::Normalized, content_hash) {
            Some(canonical) => Ok(Some(self.worker.average_hash(canonical).await?)),
            None => Ok(None),
        }
    }

    /// Difference hash of the working tier, used before geometry is confirmed.
    pub async fn provisional_hash(&self, content_hash: &str) -> Result<String, DerivationError> {
        let working = self.working(content_hash)?;
        Ok(self.worker.difference_hash(working).await?)
    }

    /// Colour histogram of the working tier. The canonical tier is grayscale,
    /// so it carries nothing to compare.
    pub async fn visual_profile(&self, content_hash: &str, bins: usize) -> Result<VisualProfile, DerivationError> {
        let working = self.working(content_hash)?;
        Ok(self.worker.visual_profile(working, bins).await?)
    }
}

fn check_ticket(ticket: Option<&PreparationTicket>) -> Result<(), DerivationError> {
    match ticket {
        Some(ticket) if !ticket.is_current() => Err(DerivationError::Superseded {
            image_id: ticket.image_id().to_string(),
        }),
        _ => Ok(()),
    }
}

/// Shared handle used by the services.
pub type SharedPipeline = Arc<DerivationPipeline>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::derivation::DerivationPolicy;
    use crate::core::hash::HashService;
    use crate::core::raster;
    use crate::models::NormalizedRect;
    use crate::store::{BlobStore, MemoryStore, StoreError};
    use image::{ImageBuffer, Rgb, RgbImage};

    fn create_test_image(width: u32, height: u32) -> Vec<u8> {
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
        });
        raster::encode_jpeg(&img, 95).unwrap()
    }

    fn pipeline() -> DerivationPipeline {
        let cache = ArtefactCache::new(Arc::new(MemoryStore::new()));
        let worker = PixelWorker::new(2, DerivationPolicy::default(), HashService::new()).unwrap();
        DerivationPipeline::new(cache, worker)
    }

    fn preparation() -> ImagePreparation {
        ImagePreparation {
            rotation: 3.0,
            rect: NormalizedRect {
                x: 0.05,
                y: 0.05,
                width: 0.9,
                height: 0.9,
            },
        }
    }

    #[tokio::test]
    async fn test_working_is_built_once() {
        let pipeline = pipeline();
        let bytes = create_test_image(200, 100);
        let identity = pipeline.identify(bytes.clone()).await.unwrap();

        pipeline
            .ensure_working(&identity.content_hash, bytes.clone())
            .await
            .unwrap();
        pipeline
            .ensure_working(&identity.content_hash, bytes)
            .await
            .unwrap();

        assert_eq!(pipeline.build_count(ArtefactTier::Working), 1);
        assert!(pipeline.has(ArtefactTier::Working, &identity.content_hash));
    }

    #[tokio::test]
    async fn test_canonical_rebuilds_missing_prepared() {
        let pipeline = pipeline();
        let bytes = create_test_image(160, 120);
        let hash = pipeline.identify(bytes.clone()).await.unwrap().content_hash;
        pipeline.ensure_working(&hash, bytes).await.unwrap();

        let canonical = pipeline
            .regenerate_canonical(&hash, &preparation(), None)
            .await
            .unwrap();

        assert!(!canonical.is_empty());
        assert_eq!(pipeline.build_count(ArtefactTier::Prepared), 1);
        assert!(pipeline.has(ArtefactTier::Prepared, &hash));
        assert!(pipeline.perceptual_hash(&hash).await.unwrap().is_some());
    }

    /// Refuses every prepared-tier write, as a full or broken backend would.
    struct NoPreparedStore(MemoryStore);

    impl BlobStore for NoPreparedStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.0.get(key)
        }
        fn put(&self, key: &str, blob: &[u8]) -> Result<(), StoreError> {
            if key.starts_with("prep::") {
                return Err(StoreError::MissingPath);
            }
            self.0.put(key, blob)
        }
        fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key)
        }
        fn clear(&self) -> Result<(), StoreError> {
            self.0.clear()
        }
    }

    #[tokio::test]
    async fn test_canonical_uses_freshly_built_prepared() {
        let bytes = create_test_image(160, 120);
        let reference = pipeline();
        let hash = reference.identify(bytes.clone()).await.unwrap().content_hash;
        reference.ensure_working(&hash, bytes.clone()).await.unwrap();
        let expected = reference
            .regenerate_canonical(&hash, &preparation(), None)
            .await
            .unwrap();

        let cache = ArtefactCache::new(Arc::new(NoPreparedStore(MemoryStore::new())));
        let worker = PixelWorker::new(2, DerivationPolicy::default(), HashService::new()).unwrap();
        let pipeline = DerivationPipeline::new(cache, worker);
        pipeline.ensure_working(&hash, bytes).await.unwrap();

        let canonical = pipeline
            .regenerate_canonical(&hash, &preparation(), None)
            .await
            .unwrap();
        assert!(!pipeline.has(ArtefactTier::Prepared, &hash));
        assert_eq!(canonical, expected);
    }

    #[tokio::test]
    async fn test_missing_working_is_reported() {
        let pipeline = pipeline();
        let result = pipeline.ensure_thumbnail("nope").await;
        assert!(matches!(result, Err(DerivationError::WorkingMissing { .. })));

        let result = pipeline
            .regenerate_canonical("nope", &preparation(), None)
            .await;
        assert!(matches!(result, Err(DerivationError::WorkingMissing { .. })));
    }

    #[tokio::test]
    async fn test_invalidate_keeps_working_and_thumbnail() {
        let pipeline = pipeline();
        let bytes = create_test_image(100, 100);
        let hash = pipeline.identify(bytes.clone()).await.unwrap().content_hash;
        pipeline.ensure_working(&hash, bytes).await.unwrap();
        pipeline.ensure_thumbnail(&hash).await.unwrap();
        pipeline
            .regenerate_canonical(&hash, &preparation(), None)
            .await
            .unwrap();

        pipeline.invalidate_prepared(&hash);

        assert!(pipeline.has(ArtefactTier::Working, &hash));
        assert!(pipeline.has(ArtefactTier::Thumbnail, &hash));
        assert!(!pipeline.has(ArtefactTier::Prepared, &hash));
        assert!(!pipeline.has(ArtefactTier::Normalized, &hash));
        assert_eq!(pipeline.perceptual_hash(&hash).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_thumbnail_served_from_cache() {
        let pipeline = pipeline();
        let bytes = create_test_image(80, 60);
        let hash = pipeline.identify(bytes.clone()).await.unwrap().content_hash;
        pipeline.ensure_working(&hash, bytes).await.unwrap();

        let first = pipeline.ensure_thumbnail(&hash).await.unwrap();
        let second = pipeline.ensure_thumbnail(&hash).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(pipeline.build_count(ArtefactTier::Thumbnail), 1);
    }
}
