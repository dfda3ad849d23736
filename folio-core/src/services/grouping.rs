use super::Warning;
use crate::config::GroupingConfig;
use crate::core::grouping;
use crate::core::pipeline::SharedPipeline;
use crate::core::project::SharedProject;
use crate::models::{GroupingProposal, ImageGroup, ImagePreparation};
use anyhow::Result;
use std::collections::HashMap;

/// Proposals from one strategy run plus any images it had to skip.
#[derive(Debug, Clone, Default)]
pub struct GroupingRun {
    pub proposals: Vec<GroupingProposal>,
    pub warnings: Vec<Warning>,
}

pub struct GroupService {
    project: SharedProject,
    pipeline: SharedPipeline,
    config: GroupingConfig,
}

impl GroupService {
    pub fn new(project: SharedProject, pipeline: SharedPipeline, config: GroupingConfig) -> Self {
        Self {
            project,
            pipeline,
            config,
        }
    }

    pub async fn run_filename(&self) -> GroupingRun {
        let project = self.project.read().await;
        GroupingRun {
            proposals: grouping::group_by_filename(project.images()),
            warnings: Vec::new(),
        }
    }

    pub async fn run_leaf_folder(&self) -> GroupingRun {
        let project = self.project.read().await;
        GroupingRun {
            proposals: grouping::group_by_leaf_folder(project.images()),
            warnings: Vec::new(),
        }
    }

    pub async fn run_individual(&self) -> GroupingRun {
        let project = self.project.read().await;
        GroupingRun {
            proposals: grouping::group_individually(project.images()),
            warnings: Vec::new(),
        }
    }

    /// Perceptual-hash clustering. Prepared images still lacking a hash get
    /// their canonical tier and average hash built first; unprepared images
    /// without a hash are skipped with a warning.
    pub async fn run_phash(&self, threshold: Option<f64>) -> Result<GroupingRun> {
        let threshold = threshold.unwrap_or(self.config.phash_threshold);
        let mut warnings = Vec::new();

        let pending: Vec<(String, String, Option<ImagePreparation>)> = {
            let project = self.project.read().await;
            project
                .images()
                .iter()
                .filter(|image| image.hashes.perceptual_hash.is_none())
                .map(|image| {
                    (
                        image.id.clone(),
                        image.content_hash().to_string(),
                        image.preparation,
                    )
                })
                .collect()
        };

        for (image_id, content_hash, preparation) in pending {
            let Some(preparation) = preparation else {
                warnings.push(Warning::for_image(
                    image_id,
                    "Image not prepared, skipping pHash generation",
                ));
                continue;
            };

            let hash = match self.hash_prepared(&content_hash, &preparation).await {
                Ok(hash) => hash,
                Err(e) => {
                    warnings.push(Warning::for_image(image_id, format!("pHash unavailable: {:#}", e)));
                    continue;
                }
            };

            let mut project = self.project.write().await;
            // Skip if the geometry changed while the hash was being built.
            let unchanged = project
                .image(&image_id)
                .is_some_and(|image| image.preparation == Some(preparation));
            if unchanged {
                project.set_perceptual_hash(&image_id, hash)?;
            }
        }

        let project = self.project.read().await;
        Ok(GroupingRun {
            proposals: grouping::group_by_perceptual_hash(project.images(), threshold),
            warnings,
        })
    }

    async fn hash_prepared(&self, content_hash: &str, preparation: &ImagePreparation) -> Result<Option<String>> {
        self.pipeline.ensure_canonical(content_hash, preparation).await?;
        Ok(self.pipeline.perceptual_hash(content_hash).await?)
    }

    /// Colour-histogram clustering over the working tier.
    pub async fn run_visual_profile(&self, threshold: Option<f64>) -> GroupingRun {
        let threshold = threshold.unwrap_or(self.config.profile_threshold);
        let images = self.project.read().await.images().to_vec();

        let mut profiles = HashMap::new();
        let mut warnings = Vec::new();
        for image in &images {
            match self
                .pipeline
                .visual_profile(image.content_hash(), self.config.profile_bins)
                .await
            {
                Ok(profile) => {
                    profiles.insert(image.id.clone(), profile);
                }
                Err(e) => warnings.push(Warning::for_image(
                    image.id.clone(),
                    format!("Visual profile unavailable: {}", e),
                )),
            }
        }

        GroupingRun {
            proposals: grouping::group_by_visual_profile(&images, &profiles, threshold),
            warnings,
        }
    }

    pub async fn apply_proposal(&self, proposal: &GroupingProposal) -> Option<ImageGroup> {
        self.project.write().await.apply_proposal(&proposal.image_ids)
    }

    pub async fn split_group(&self, group_id: &str) -> Result<Vec<ImageGroup>> {
        Ok(self.project.write().await.split_group(group_id)?)
    }
}
