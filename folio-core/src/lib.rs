//! Content-addressed image derivation, similarity grouping and workflow
//! invalidation for manuscript imaging projects.
//!
//! Images are identified by a digest of their rendered pixels. Every derived
//! artefact (working copy, prepared copy, canonical grayscale square,
//! thumbnail) is rebuilt on demand from its parent tier, so the artefact
//! cache can be dropped at any time. Moving an image back to an earlier
//! workflow stage drops the groups, alignments and annotations that depended
//! on the later stages.

pub mod config;
pub mod core;
pub mod models;
pub mod services;
pub mod store;

pub use crate::config::FolioConfig;
pub use crate::core::project::{ProjectState, SharedProject};
pub use crate::core::proposals::ProposalSet;
pub use crate::core::workflow::WorkflowStage;
pub use crate::services::{Warning, Workspace};
