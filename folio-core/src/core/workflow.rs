//! Per-image workflow stages and the downstream cascade each stage implies.
//!
//! ```text
//! ingested   → file known, geometry not confirmed
//! prepared   → geometry confirmed by a human
//! grouped    → grouping confirmed
//! aligned    → alignment confirmed
//! annotated  → annotations exist
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStage {
    Ingested,
    Prepared,
    Grouped,
    Aligned,
    Annotated,
}

#[derive(Debug, Error)]
#[error("Unknown workflow stage: {0}")]
pub struct UnknownStage(pub String);

impl WorkflowStage {
    pub const ALL: [WorkflowStage; 5] = [
        WorkflowStage::Ingested,
        WorkflowStage::Prepared,
        WorkflowStage::Grouped,
        WorkflowStage::Aligned,
        WorkflowStage::Annotated,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStage::Ingested => "ingested",
            WorkflowStage::Prepared => "prepared",
            WorkflowStage::Grouped => "grouped",
            WorkflowStage::Aligned => "aligned",
            WorkflowStage::Annotated => "annotated",
        }
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// Which downstream entities must be dropped when an image lands on a stage.
///
/// Driven purely by the stage's position, so a backward move and a forward
/// move to the same stage cascade identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CascadePlan {
    pub groups: bool,
    pub alignments: bool,
    pub annotations: bool,
}

impl CascadePlan {
    pub fn for_stage(stage: WorkflowStage) -> Self {
        let index = stage.index();
        Self {
            groups: index <= WorkflowStage::Prepared.index(),
            alignments: index <= WorkflowStage::Grouped.index(),
            annotations: index <= WorkflowStage::Aligned.index(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.groups && !self.alignments && !self.annotations
    }
}
