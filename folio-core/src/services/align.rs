use crate::core::pipeline::SharedPipeline;
use crate::core::project::SharedProject;
use crate::models::ImageAlignment;
use anyhow::{Context, Result};

/// Alignment bookkeeping for the external alignment estimator, which works on
/// prepared images and hands back transforms.
pub struct AlignService {
    project: SharedProject,
    pipeline: SharedPipeline,
}

impl AlignService {
    pub fn new(project: SharedProject, pipeline: SharedPipeline) -> Self {
        Self { project, pipeline }
    }

    /// Prepared bytes for an image, rebuilt from its stored preparation if the
    /// cache lost them.
    pub async fn ensure_prepared_image(&self, image_id: &str) -> Result<Vec<u8>> {
        let (content_hash, preparation) = {
            let project = self.project.read().await;
            let image = project
                .image(image_id)
                .with_context(|| format!("Image not found: {}", image_id))?;
            let preparation = image
                .preparation
                .with_context(|| format!("Image {} has no confirmed preparation", image_id))?;
            (image.content_hash().to_string(), preparation)
        };

        self.pipeline
            .ensure_prepared(&content_hash, &preparation)
            .await
            .with_context(|| format!("Failed to load prepared image for {}", image_id))
    }

    pub async fn record_alignment(&self, alignment: ImageAlignment) -> Result<()> {
        let mut project = self.project.write().await;
        project
            .add_alignment(alignment)
            .context("Failed to record alignment")
    }

    pub async fn alignments_for_image(&self, image_id: &str) -> Vec<ImageAlignment> {
        let project = self.project.read().await;
        project
            .alignments_for_image(image_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn clear_image_alignments(&self, image_id: &str) -> usize {
        self.project.write().await.remove_alignments_for_image(image_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FolioConfig;
    use crate::core::project::ProjectState;
    use crate::core::raster;
    use crate::models::{AlignmentTransform, ImagePreparation, NormalizedRect, TransformKind};
    use crate::services::{IngestInput, Workspace};
    use crate::store::{ArtefactTier, MemoryStore};
    use image::{ImageBuffer, Rgb, RgbImage};
    use std::sync::Arc;

    fn create_test_image(seed: u8) -> Vec<u8> {
        let img: RgbImage = ImageBuffer::from_fn(48, 32, |x, y| Rgb([x as u8 * 5, y as u8 * 7, seed]));
        raster::encode_jpeg(&img, 95).unwrap()
    }

    async fn setup() -> (Workspace, Vec<String>) {
        let workspace =
            Workspace::with_store(FolioConfig::default(), ProjectState::new(), Arc::new(MemoryStore::new())).unwrap();
        let inputs = [10u8, 200]
            .into_iter()
            .map(|seed| IngestInput {
                source: create_test_image(seed).into(),
                label: None,
                structural_path: None,
            })
            .collect();
        let ids = workspace.ingest().ingest(inputs, None).await.unwrap().image_ids;
        (workspace, ids)
    }

    #[tokio::test]
    async fn test_ensure_prepared_requires_preparation() {
        let (workspace, ids) = setup().await;
        let service = workspace.align();
        assert!(service.ensure_prepared_image(&ids[0]).await.is_err());

        let preparation = ImagePreparation {
            rotation: 90.0,
            rect: NormalizedRect::FULL,
        };
        workspace
            .prepare()
            .confirm_preparation(&ids[..1], preparation)
            .await
            .unwrap();

        // Drop the prepared tier; it comes back from the stored preparation.
        let hash = workspace.project().read().await.image(&ids[0]).unwrap().content_hash().to_string();
        workspace.pipeline().invalidate_prepared(&hash);

        let prepared = service.ensure_prepared_image(&ids[0]).await.unwrap();
        let dims = raster::decode(&prepared).unwrap();
        assert_eq!((dims.width(), dims.height()), (32, 48));
        assert!(workspace.pipeline().has(ArtefactTier::Prepared, &hash));
    }

    #[tokio::test]
    async fn test_record_and_clear_alignments() {
        let (workspace, ids) = setup().await;
        let service = workspace.align();

        let (source_hash, target_hash) = {
            let project = workspace.project().read().await;
            (
                project.image(&ids[0]).unwrap().content_hash().to_string(),
                project.image(&ids[1]).unwrap().content_hash().to_string(),
            )
        };
        let alignment = ImageAlignment {
            source_image_id: ids[0].clone(),
            target_image_id: ids[1].clone(),
            source_content_hash: source_hash,
            target_content_hash: target_hash,
            confidence: 0.8,
            method: "orb".to_string(),
            transform: AlignmentTransform {
                kind: TransformKind::Homography,
                matrix: [1.0, 0.0, 2.0, 0.0, 1.0, -3.0, 0.0, 0.0, 1.0],
            },
        };

        service.record_alignment(alignment.clone()).await.unwrap();
        assert_eq!(service.alignments_for_image(&ids[1]).await, vec![alignment.clone()]);

        let mut stale = alignment;
        stale.target_content_hash = "outdated".to_string();
        assert!(service.record_alignment(stale).await.is_err());

        assert_eq!(service.clear_image_alignments(&ids[0]).await, 1);
        assert!(service.alignments_for_image(&ids[0]).await.is_empty());
    }
}
