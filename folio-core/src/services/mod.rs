//! Orchestration over the core: each service holds shared handles to the
//! project state and the derivation pipeline and reports per-image failures
//! as warnings instead of aborting a batch.

pub mod align;
pub mod grouping;
pub mod ingest;
pub mod prepare;

pub use align::AlignService;
pub use grouping::{GroupService, GroupingRun};
pub use ingest::{IngestInput, IngestReport, IngestService, InputSource};
pub use prepare::{PrepareService, PreparationReport};

use crate::config::FolioConfig;
use crate::core::derivation::TierVersions;
use crate::core::hash::HashService;
use crate::core::pipeline::{DerivationPipeline, SharedPipeline};
use crate::core::project::{ProjectState, SharedProject};
use crate::core::worker::PixelWorker;
use crate::store::{self, ArtefactCache, BlobStore};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// A per-image failure that did not stop the surrounding operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    pub message: String,
}

impl Warning {
    pub fn for_image(image_id: impl Into<String>, message: impl Into<String>) -> Self {
        let warning = Self {
            image_id: Some(image_id.into()),
            message: message.into(),
        };
        log::warn!("{}", warning);
        warning
    }

    pub fn general(message: impl Into<String>) -> Self {
        let warning = Self {
            image_id: None,
            message: message.into(),
        };
        log::warn!("{}", warning);
        warning
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.image_id {
            Some(image_id) => write!(f, "{}: {}", image_id, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Everything a session needs: project state, pipeline and config, wired
/// together once.
#[derive(Debug, Clone)]
pub struct Workspace {
    project: SharedProject,
    pipeline: SharedPipeline,
    config: FolioConfig,
}

impl Workspace {
    /// Opens the cache backend named in the config.
    pub fn open(config: FolioConfig, project: ProjectState) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let store = store::open_store(&config.cache).context("Failed to open artefact cache")?;
        Self::with_store(config, project, store)
    }

    pub fn with_store(config: FolioConfig, project: ProjectState, store: Arc<dyn BlobStore>) -> Result<Self> {
        let policy = config.derivation.policy;
        let cache = ArtefactCache::with_versions(store, TierVersions::for_policy(&policy));
        let hash_service = HashService::with_canvas_dimension(config.derivation.hash_canvas_dimension);
        let worker = PixelWorker::new(config.worker.threads, policy, hash_service)
            .context("Failed to start pixel worker")?;

        Ok(Self {
            project: project.into_shared(),
            pipeline: Arc::new(DerivationPipeline::new(cache, worker)),
            config,
        })
    }

    pub fn project(&self) -> &SharedProject {
        &self.project
    }

    pub fn pipeline(&self) -> &SharedPipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &FolioConfig {
        &self.config
    }

    pub fn ingest(&self) -> IngestService {
        IngestService::new(self.project.clone(), self.pipeline.clone(), self.config.ingest.clone())
    }

    pub fn prepare(&self) -> PrepareService {
        PrepareService::new(self.project.clone(), self.pipeline.clone())
    }

    pub fn grouping(&self) -> GroupService {
        GroupService::new(self.project.clone(), self.pipeline.clone(), self.config.grouping.clone())
    }

    pub fn align(&self) -> AlignService {
        AlignService::new(self.project.clone(), self.pipeline.clone())
    }
}
