use crate::core::workflow::WorkflowStage;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Image models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structural_path: Option<String>,
    pub hashes: ImageHashes,
    pub dimensions: Dimensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preparation: Option<ImagePreparation>,
    pub workflow: WorkflowState,
}

impl ImageSource {
    /// A freshly ingested image: no preparation, stage `ingested`.
    pub fn ingested(
        content_hash: String,
        dimensions: Dimensions,
        label: Option<String>,
        structural_path: Option<String>,
    ) -> Self {
        Self {
            id: format!("img_{}", Uuid::new_v4().simple()),
            label,
            structural_path,
            hashes: ImageHashes {
                content_hash,
                perceptual_hash: None,
            },
            dimensions,
            preparation: None,
            workflow: WorkflowState::at(WorkflowStage::Ingested),
        }
    }

    pub fn content_hash(&self) -> &str {
        &self.hashes.content_hash
    }

    pub fn stage(&self) -> WorkflowStage {
        self.workflow.stage
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageHashes {
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perceptual_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Human-confirmed geometry: rotation in degrees, then a crop expressed as
/// fractions of the rotated canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImagePreparation {
    pub rotation: f64,
    pub rect: NormalizedRect,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl NormalizedRect {
    pub const FULL: NormalizedRect = NormalizedRect {
        x: 0.0,
        y: 0.0,
        width: 1.0,
        height: 1.0,
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub stage: WorkflowStage,
    pub updated_at: String,
}

impl WorkflowState {
    pub fn at(stage: WorkflowStage) -> Self {
        Self {
            stage,
            updated_at: Utc::now().to_rfc3339(),
        }
    }
}

// Group models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageGroup {
    pub id: String,
    pub base_image_id: String,
    pub image_ids: Vec<String>,
    pub locked: bool,
}

impl ImageGroup {
    /// Builds an unlocked group whose base is the first id. Returns `None` for
    /// an empty list since a memberless group must not exist.
    pub fn from_members(image_ids: Vec<String>) -> Option<Self> {
        let base_image_id = image_ids.first()?.clone();
        Some(Self {
            id: format!("grp_{}", Uuid::new_v4().simple()),
            base_image_id,
            image_ids,
            locked: false,
        })
    }

    pub fn contains(&self, image_id: &str) -> bool {
        self.image_ids.iter().any(|id| id == image_id)
    }
}

// Alignment models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAlignment {
    pub source_image_id: String,
    pub target_image_id: String,
    pub source_content_hash: String,
    pub target_content_hash: String,
    pub confidence: f64,
    pub method: String,
    pub transform: AlignmentTransform,
}

impl ImageAlignment {
    pub fn references(&self, image_id: &str) -> bool {
        self.source_image_id == image_id || self.target_image_id == image_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentTransform {
    #[serde(rename = "type")]
    pub kind: TransformKind,
    pub matrix: [f64; 9],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    Affine,
    Homography,
}

// Annotation models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub base_image_content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compared_image_content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment_id: Option<String>,
    pub data: serde_json::Value,
}

impl Annotation {
    pub fn references_hash(&self, content_hash: &str) -> bool {
        self.base_image_content_hash == content_hash
            || self.compared_image_content_hash.as_deref() == Some(content_hash)
    }
}

// Grouping proposals are transient and never persisted with the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupingProposal {
    pub id: String,
    pub image_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl GroupingProposal {
    pub fn new(image_ids: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            id: format!("prop_{}", Uuid::new_v4().simple()),
            image_ids,
            reason: Some(reason.into()),
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

// Project document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectSnapshot {
    pub name: String,
    pub created_at: String,
    pub images: Vec<ImageSource>,
    pub groups: Vec<ImageGroup>,
    pub alignments: Vec<ImageAlignment>,
    pub annotations: Vec<Annotation>,
}

impl ProjectSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at: Utc::now().to_rfc3339(),
            ..Self::default()
        }
    }
}
