use super::Warning;
use crate::config::IngestConfig;
use crate::core::pipeline::SharedPipeline;
use crate::core::project::SharedProject;
use crate::core::queue::{JobQueue, ProgressCallback};
use crate::models::ImageSource;
use crate::store::ArtefactTier;
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Where an original's bytes come from. Files are only read once their job
/// holds a queue slot.
#[derive(Debug, Clone)]
pub enum InputSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl InputSource {
    async fn load(self) -> std::io::Result<Vec<u8>> {
        match self {
            InputSource::Bytes(bytes) => Ok(bytes),
            InputSource::File(path) => tokio::fs::read(path).await,
        }
    }
}

impl From<Vec<u8>> for InputSource {
    fn from(bytes: Vec<u8>) -> Self {
        InputSource::Bytes(bytes)
    }
}

impl From<PathBuf> for InputSource {
    fn from(path: PathBuf) -> Self {
        InputSource::File(path)
    }
}

/// One original handed over by the ingestion collaborator.
#[derive(Debug, Clone)]
pub struct IngestInput {
    pub source: InputSource,
    pub label: Option<String>,
    pub structural_path: Option<String>,
}

impl IngestInput {
    /// Name used in warnings and logs.
    pub fn display_name(&self) -> String {
        self.label
            .clone()
            .or_else(|| self.structural_path.clone())
            .or_else(|| match &self.source {
                InputSource::File(path) => Some(path.display().to_string()),
                InputSource::Bytes(_) => None,
            })
            .unwrap_or_else(|| "unnamed input".to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// Ids of every successfully ingested input, in input order.
    pub image_ids: Vec<String>,
    pub added: usize,
    pub updated: usize,
    pub warnings: Vec<Warning>,
}

pub struct IngestService {
    project: SharedProject,
    pipeline: SharedPipeline,
    config: IngestConfig,
}

impl IngestService {
    pub fn new(project: SharedProject, pipeline: SharedPipeline, config: IngestConfig) -> Self {
        Self {
            project,
            pipeline,
            config,
        }
    }

    /// Hashes and derives every input through a bounded queue, then records
    /// the results. Re-ingesting identical pixels refreshes the existing
    /// image instead of adding a second one. An input that cannot be read,
    /// decoded or derived (including a job that panics) becomes a warning
    /// and the rest of the batch is kept.
    pub async fn ingest(
        &self,
        inputs: Vec<IngestInput>,
        progress: Option<ProgressCallback>,
    ) -> Result<IngestReport> {
        let mut queue = JobQueue::new("ingest", self.config.job_limit, inputs.len());
        if let Some(callback) = progress {
            queue = queue.on_progress(callback);
        }

        let mut names = Vec::with_capacity(inputs.len());
        for input in inputs {
            names.push(input.display_name());
            let pipeline = self.pipeline.clone();
            let provisional = self.config.provisional_dhash;
            queue
                .push(async move { ingest_one(pipeline, input, provisional).await })
                .await
                .context("Failed to schedule ingest job")?;
        }

        let outcomes = queue.join().await;

        let mut report = IngestReport::default();
        let mut project = self.project.write().await;
        for (name, outcome) in names.into_iter().zip(outcomes) {
            match outcome {
                Ok(Ok(image)) => {
                    let (id, inserted) = project.upsert_image_by_content_hash(image);
                    if inserted {
                        report.added += 1;
                    } else {
                        report.updated += 1;
                    }
                    report.image_ids.push(id);
                }
                Ok(Err(warning)) => report.warnings.push(warning),
                Err(e) => report
                    .warnings
                    .push(Warning::general(format!("{}: {}", name, e))),
            }
        }

        log::info!(
            "Ingested {} images ({} new, {} updated, {} failed)",
            report.image_ids.len(),
            report.added,
            report.updated,
            report.warnings.len()
        );
        Ok(report)
    }

    /// Ids of images whose working artefact is no longer cached. Those need
    /// their originals again before anything downstream can be rebuilt.
    pub async fn missing_working(&self) -> Vec<String> {
        let project = self.project.read().await;
        project
            .images()
            .iter()
            .filter(|image| !self.pipeline.has(ArtefactTier::Working, image.content_hash()))
            .map(|image| image.id.clone())
            .collect()
    }

    /// Re-derives the working tier for an image from its original bytes.
    ///
    /// The bytes must decode to the image's recorded content hash.
    pub async fn rehydrate(&self, image_id: &str, original: Vec<u8>) -> Result<()> {
        let content_hash = {
            let project = self.project.read().await;
            project
                .image(image_id)
                .with_context(|| format!("Image not found: {}", image_id))?
                .content_hash()
                .to_string()
        };

        let identity = self.pipeline.identify(original.clone()).await?;
        if identity.content_hash != content_hash {
            anyhow::bail!(
                "Original for {} has content hash {}, expected {}",
                image_id,
                identity.content_hash,
                content_hash
            );
        }

        self.pipeline.ensure_working(&content_hash, original).await?;
        self.pipeline.ensure_thumbnail(&content_hash).await?;
        Ok(())
    }

    /// Builds any missing thumbnails. Images whose working tier is gone
    /// come back as warnings.
    pub async fn ensure_thumbnails(&self) -> Vec<Warning> {
        let images: Vec<(String, String)> = {
            let project = self.project.read().await;
            project
                .images()
                .iter()
                .map(|image| (image.id.clone(), image.content_hash().to_string()))
                .collect()
        };

        let mut warnings = Vec::new();
        for (id, hash) in images {
            if let Err(e) = self.pipeline.ensure_thumbnail(&hash).await {
                warnings.push(Warning::for_image(id, format!("Thumbnail unavailable: {}", e)));
            }
        }
        warnings
    }
}

async fn ingest_one(
    pipeline: SharedPipeline,
    input: IngestInput,
    provisional: bool,
) -> std::result::Result<ImageSource, Warning> {
    let name = input.display_name();
    let fail = |message: String| Warning::general(format!("{}: {}", name, message));

    let bytes = input
        .source
        .load()
        .await
        .map_err(|e| fail(format!("Failed to read original: {}", e)))?;

    let identity = pipeline
        .identify(bytes.clone())
        .await
        .map_err(|e| fail(e.to_string()))?;
    let hash = identity.content_hash.clone();

    pipeline
        .ensure_working(&hash, bytes)
        .await
        .map_err(|e| fail(e.to_string()))?;
    pipeline
        .ensure_thumbnail(&hash)
        .await
        .map_err(|e| fail(e.to_string()))?;

    let mut image = ImageSource::ingested(
        identity.content_hash,
        identity.dimensions,
        input.label,
        input.structural_path,
    );

    if provisional {
        match pipeline.provisional_hash(&hash).await {
            Ok(dhash) => image.hashes.perceptual_hash = Some(dhash),
            Err(e) => log::warn!("No provisional hash for {}: {}", name, e),
        }
    }

    log::debug!("Ingested {} as {}", name, hash);
    Ok(image)
}
