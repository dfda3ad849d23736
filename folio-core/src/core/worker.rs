//! Off-thread pixel work.
//!
//! Decoding, resampling, hashing and histogramming all run on a dedicated
//! rayon pool. Callers hand over owned buffers and await a oneshot reply, so
//! the async side never blocks on CPU-bound work.

use crate::core::derivation::{self, DerivationPolicy};
use crate::core::hash::{HashError, HashService};
use crate::core::profile::{self, VisualProfile};
use crate::core::raster::{self, RasterError};
use crate::models::{Dimensions, ImagePreparation};
use image::GenericImageView;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Hash(#[from] HashError),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error("Failed to start pixel worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Pixel worker dropped the task before replying")]
    Disconnected,

    #[error("Pixel worker replied with the wrong output for {task}")]
    UnexpectedOutput { task: &'static str },
}

/// Identity of a freshly decoded original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentIdentity {
    pub content_hash: String,
    pub dimensions: Dimensions,
}

#[derive(Debug)]
pub enum PixelTask {
    ContentIdentity { bytes: Vec<u8> },
    DifferenceHash { bytes: Vec<u8> },
    AverageHash { bytes: Vec<u8> },
    BuildWorking { original: Vec<u8> },
    BuildPrepared { working: Vec<u8>, preparation: ImagePreparation },
    BuildCanonical { prepared: Vec<u8> },
    BuildThumbnail { working: Vec<u8> },
    VisualProfile { bytes: Vec<u8>, bins: usize },
}

impl PixelTask {
    pub fn name(&self) -> &'static str {
        match self {
            PixelTask::ContentIdentity { .. } => "content identity",
            PixelTask::DifferenceHash { .. } => "difference hash",
            PixelTask::AverageHash { .. } => "average hash",
            PixelTask::BuildWorking { .. } => "working build",
            PixelTask::BuildPrepared { .. } => "prepared build",
            PixelTask::BuildCanonical { .. } => "canonical build",
            PixelTask::BuildThumbnail { .. } => "thumbnail build",
            PixelTask::VisualProfile { .. } => "visual profile",
        }
    }
}

#[derive(Debug)]
pub enum PixelOutput {
    Identity(ContentIdentity),
    Hash(String),
    Blob(Vec<u8>),
    Profile(VisualProfile),
}

struct PixelJob {
    task: PixelTask,
    result_sender: oneshot::Sender<Result<PixelOutput, WorkerError>>,
}

#[derive(Clone)]
pub struct PixelWorker {
    pool: Arc<rayon::ThreadPool>,
    hash_service: HashService,
    policy: DerivationPolicy,
}

impl PixelWorker {
    pub fn new(
        threads: usize,
        policy: DerivationPolicy,
        hash_service: HashService,
    ) -> Result<Self, WorkerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|index| format!("folio-pixel-{}", index))
            .panic_handler(|_| log::error!("Pixel task panicked; its caller sees a disconnect"))
            .build()?;

        log::info!("Pixel worker started with {} threads", pool.current_num_threads());

        Ok(Self {
            pool: Arc::new(pool),
            hash_service,
            policy,
        })
    }

    pub fn policy(&self) -> &DerivationPolicy {
        &self.policy
    }

    pub async fn submit(&self, task: PixelTask) -> Result<PixelOutput, WorkerError> {
        let (result_sender, result_receiver) = oneshot::channel();
        let job = PixelJob { task, result_sender };

        let hash_service = self.hash_service.clone();
        let policy = self.policy;
        self.pool.spawn(move || {
            let output = run_task(job.task, &hash_service, &policy);
            // The caller may have given up waiting.
            let _ = job.result_sender.send(output);
        });

        result_receiver.await.map_err(|_| WorkerError::Disconnected)?
    }

    pub async fn content_identity(&self, bytes: Vec<u8>) -> Result<ContentIdentity, WorkerError> {
        match self.submit(PixelTask::ContentIdentity { bytes }).await? {
            PixelOutput::Identity(identity) => Ok(identity),
            _ => Err(WorkerError::UnexpectedOutput { task: "content identity" }),
        }
    }

    pub async fn difference_hash(&self, bytes: Vec<u8>) -> Result<String, WorkerError> {
        self.expect_hash(PixelTask::DifferenceHash { bytes }).await
    }

    pub async fn average_hash(&self, bytes: Vec<u8>) -> Result<String, WorkerError> {
        self.expect_hash(PixelTask::AverageHash { bytes }).await
    }

    pub async fn build_working(&self, original: Vec<u8>) -> Result<Vec<u8>, WorkerError> {
        self.expect_blob(PixelTask::BuildWorking { original }).await
    }

    pub async fn build_prepared(
        &self,
        working: Vec<u8>,
        preparation: ImagePreparation,
    ) -> Result<Vec<u8>, WorkerError> {
        self.expect_blob(PixelTask::BuildPrepared { working, preparation }).await
    }

    pub async fn build_canonical(&self, prepared: Vec<u8>) -> Result<Vec<u8>, WorkerError> {
        self.expect_blob(PixelTask::BuildCanonical { prepared }).await
    }

    pub async fn build_thumbnail(&self, working: Vec<u8>) -> Result<Vec<u8>, WorkerError> {
        self.expect_blob(PixelTask::BuildThumbnail { working }).await
    }

    pub async fn visual_profile(&self, bytes: Vec<u8>, bins: usize) -> Result<VisualProfile, WorkerError> {
        match self.submit(PixelTask::VisualProfile { bytes, bins }).await? {
            PixelOutput::Profile(profile) => Ok(profile),
            _ => Err(WorkerError::UnexpectedOutput { task: "visual profile" }),
        }
    }

    async fn expect_hash(&self, task: PixelTask) -> Result<String, WorkerError> {
        let name = task.name();
        match self.submit(task).await? {
            PixelOutput::Hash(hash) => Ok(hash),
            _ => Err(WorkerError::UnexpectedOutput { task: name }),
        }
    }

    async fn expect_blob(&self, task: PixelTask) -> Result<Vec<u8>, WorkerError> {
        let name = task.name();
        match self.submit(task).await? {
            PixelOutput::Blob(blob) => Ok(blob),
            _ => Err(WorkerError::UnexpectedOutput { task: name }),
        }
    }
}

impl std::fmt::Debug for PixelWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelWorker")
            .field("threads", &self.pool.current_num_threads())
            .field("policy", &self.policy)
            .finish()
    }
}

fn run_task(
    task: PixelTask,
    hash_service: &HashService,
    policy: &DerivationPolicy,
) -> Result<PixelOutput, WorkerError> {
    let output = match task {
        PixelTask::ContentIdentity { bytes } => {
            let img = raster::decode(&bytes)?;
            let (width, height) = img.dimensions();
            PixelOutput::Identity(ContentIdentity {
                content_hash: hash_service.content_hash_of(&img),
                dimensions: Dimensions { width, height },
            })
        }
        PixelTask::DifferenceHash { bytes } => {
            PixelOutput::Hash(hash_service.compute_difference_hash(&bytes)?)
        }
        PixelTask::AverageHash { bytes } => {
            PixelOutput::Hash(hash_service.compute_average_hash(&bytes)?)
        }
        PixelTask::BuildWorking { original } => {
            PixelOutput::Blob(derivation::build_working(&original, policy)?)
        }
        PixelTask::BuildPrepared { working, preparation } => {
            PixelOutput::Blob(derivation::build_prepared(&working, &preparation, policy)?)
        }
        PixelTask::BuildCanonical { prepared } => {
            PixelOutput::Blob(derivation::build_canonical(&prepared, policy)?)
        }
        PixelTask::BuildThumbnail { working } => {
            PixelOutput::Blob(derivation::build_thumbnail(&working, policy)?)
        }
        PixelTask::VisualProfile { bytes, bins } => {
            let img = raster::decode(&bytes)?;
            let flat = raster::flatten_on_white(&img);
            PixelOutput::Profile(profile::extract_visual_profile(&flat, bins))
        }
    };
    Ok(output)
}
