use super::Warning;
use crate::core::pipeline::{DerivationError, SharedPipeline};
use crate::core::project::{ProjectError, SharedProject};
use crate::core::raster;
use crate::models::ImagePreparation;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Default)]
pub struct PreparationReport {
    pub prepared: Vec<String>,
    /// Images whose result was discarded because a newer preparation started.
    pub superseded: Vec<String>,
    pub warnings: Vec<Warning>,
}

enum Outcome {
    Prepared,
    Superseded,
}

pub struct PrepareService {
    project: SharedProject,
    pipeline: SharedPipeline,
}

impl PrepareService {
    pub fn new(project: SharedProject, pipeline: SharedPipeline) -> Self {
        Self { project, pipeline }
    }

    /// Applies one confirmed preparation to each image in turn.
    ///
    /// Per image: record the preparation and move to `prepared` (dropping
    /// groups, alignments and annotations), drop the stale prepared and
    /// canonical tiers, rebuild both, then hash the canonical tier. A failure
    /// on one image becomes a warning and the batch continues.
    pub async fn confirm_preparation(
        &self,
        image_ids: &[String],
        preparation: ImagePreparation,
    ) -> Result<PreparationReport> {
        raster::validate_preparation(&preparation).context("Rejected preparation")?;

        let mut report = PreparationReport::default();
        for image_id in image_ids {
            match self.prepare_one(image_id, preparation).await {
                Ok(Outcome::Prepared) => report.prepared.push(image_id.clone()),
                Ok(Outcome::Superseded) => {
                    log::info!("Discarded superseded preparation of {}", image_id);
                    report.superseded.push(image_id.clone());
                }
                Err(e) => report
                    .warnings
                    .push(Warning::for_image(image_id.clone(), format!("{:#}", e))),
            }
        }

        Ok(report)
    }

    async fn prepare_one(&self, image_id: &str, preparation: ImagePreparation) -> Result<Outcome> {
        let ticket = {
            let mut project = self.project.write().await;
            let (ticket, cascade) = project.begin_preparation(image_id, preparation)?;
            log::debug!("Preparing {} (generation {}): {:?}", image_id, ticket.generation(), cascade);
            ticket
        };
        let hash = ticket.content_hash().to_string();

        self.pipeline.invalidate_prepared(&hash);

        let rebuilt = async {
            self.pipeline
                .regenerate_prepared(&hash, &preparation, Some(&ticket))
                .await?;
            self.pipeline
                .regenerate_canonical(&hash, &preparation, Some(&ticket))
                .await?;
            self.pipeline.perceptual_hash(&hash).await
        };

        let perceptual_hash = match rebuilt.await {
            Ok(hash) => hash,
            Err(DerivationError::Superseded { .. }) => return Ok(Outcome::Superseded),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to derive prepared image for {}", image_id))
            }
        };

        let mut project = self.project.write().await;
        match project.finish_preparation(&ticket, perceptual_hash) {
            Ok(()) => Ok(Outcome::Prepared),
            Err(ProjectError::Superseded { .. }) => Ok(Outcome::Superseded),
            Err(e) => Err(e.into()),
        }
    }
}
