//! Authoritative in-memory project state.
//!
//! All mutation of images, groups, alignments and annotations goes through
//! `ProjectState`, which keeps the cross-entity invariants:
//!
//! - every group is non-empty and its base image is one of its members
//! - alignments reference existing images by their current content hashes
//! - annotations reference content hashes of existing images
//! - stage changes drop downstream entities according to `CascadePlan`;
//!   moving an image to `prepared` or earlier takes it out of every group,
//!   though a confirmed proposal may still group images at any stage

use crate::core::workflow::{CascadePlan, WorkflowStage};
use crate::models::{
    Annotation, ImageAlignment, ImageGroup, ImagePreparation, ImageSource, ProjectSnapshot,
    WorkflowState,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Image not found: {image_id}")]
    ImageNotFound { image_id: String },

    #[error("Group not found: {group_id}")]
    GroupNotFound { group_id: String },

    #[error("Image {image_id} is not a member of group {group_id}")]
    NotAMember { group_id: String, image_id: String },

    #[error("Invalid group {group_id}: {reason}")]
    InvalidGroup { group_id: String, reason: String },

    #[error("Alignment for {image_id} does not match its current content hash")]
    StaleAlignment { image_id: String },

    #[error("Preparation of {image_id} was superseded (generation {generation})")]
    Superseded { image_id: String, generation: u64 },
}

/// What a cascade removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub groups_touched: usize,
    pub groups_deleted: usize,
    pub alignments_removed: usize,
    pub annotations_removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRemoval {
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationStatus {
    None,
    Valid,
    Mismatch,
}

/// Proof that a preparation was started at a given generation.
///
/// A newer preparation of the same image bumps the generation, after which
/// every older ticket reports itself stale and its results are discarded.
#[derive(Debug, Clone)]
pub struct PreparationTicket {
    image_id: String,
    content_hash: String,
    generation: u64,
    current: Arc<AtomicU64>,
}

impl PreparationTicket {
    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

pub type SharedProject = Arc<RwLock<ProjectState>>;

#[derive(Debug, Default)]
pub struct ProjectState {
    images: Vec<ImageSource>,
    groups: Vec<ImageGroup>,
    alignments: Vec<ImageAlignment>,
    annotations: Vec<Annotation>,
    generations: HashMap<String, Arc<AtomicU64>>,
}

impl ProjectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a persisted document, dropping anything that breaks the
    /// invariants (empty groups, references to unknown images, stale
    /// alignments, annotations on content no image has).
    pub fn from_snapshot(snapshot: ProjectSnapshot) -> Self {
        let mut state = Self {
            images: snapshot.images,
            ..Self::default()
        };

        for group in snapshot.groups {
            if let Err(e) = state.add_group(group) {
                log::warn!("Dropping group on load: {}", e);
            }
        }
        for alignment in snapshot.alignments {
            if let Err(e) = state.add_alignment(alignment) {
                log::warn!("Dropping alignment on load: {}", e);
            }
        }
        for annotation in snapshot.annotations {
            let known = |hash: &str| state.image_by_content_hash(hash).is_some();
            let compared_known = annotation
                .compared_image_content_hash
                .as_deref()
                .map_or(true, |hash| known(hash));
            if known(&annotation.base_image_content_hash) && compared_known {
                state.annotations.push(annotation);
            } else {
                log::warn!(
                    "Dropping annotation on load: unknown content hash {}",
                    annotation.base_image_content_hash
                );
            }
        }
        state
    }

    /// Writes the current state into `snapshot`, keeping its name and creation time.
    pub fn to_snapshot(&self, mut snapshot: ProjectSnapshot) -> ProjectSnapshot {
        snapshot.images = self.images.clone();
        snapshot.groups = self.groups.clone();
        snapshot.alignments = self.alignments.clone();
        snapshot.annotations = self.annotations.clone();
        snapshot
    }

    pub fn into_shared(self) -> SharedProject {
        Arc::new(RwLock::new(self))
    }

    // Images

    pub fn images(&self) -> &[ImageSource] {
        &self.images
    }

    pub fn image(&self, image_id: &str) -> Option<&ImageSource> {
        self.images.iter().find(|image| image.id == image_id)
    }

    pub fn image_by_content_hash(&self, content_hash: &str) -> Option<&ImageSource> {
        self.images
            .iter()
            .find(|image| image.content_hash() == content_hash)
    }

    fn image_mut(&mut self, image_id: &str) -> Result<&mut ImageSource, ProjectError> {
        self.images
            .iter_mut()
            .find(|image| image.id == image_id)
            .ok_or_else(|| ProjectError::ImageNotFound {
                image_id: image_id.to_string(),
            })
    }

    /// Inserts `image`, replacing any image with the same id.
    pub fn add_image(&mut self, image: ImageSource) {
        match self.images.iter_mut().find(|existing| existing.id == image.id) {
            Some(existing) => *existing = image,
            None => self.images.push(image),
        }
        self.prune_stale_alignments();
    }

    /// Adds the image, or refreshes the existing image with the same content
    /// hash. Returns the id that now holds the content and whether it is new.
    ///
    /// A refresh only takes over label, path and dimensions: stage,
    /// preparation and perceptual hash belong to the existing record.
    pub fn upsert_image_by_content_hash(&mut self, image: ImageSource) -> (String, bool) {
        let existing = self
            .images
            .iter_mut()
            .find(|existing| existing.content_hash() == image.content_hash());

        match existing {
            Some(existing) => {
                if image.label.is_some() {
                    existing.label = image.label;
                }
                if image.structural_path.is_some() {
                    existing.structural_path = image.structural_path;
                }
                existing.dimensions = image.dimensions;
                if existing.hashes.perceptual_hash.is_none() {
                    existing.hashes.perceptual_hash = image.hashes.perceptual_hash;
                }
                (existing.id.clone(), false)
            }
            None => {
                let id = image.id.clone();
                self.images.push(image);
                (id, true)
            }
        }
    }

    /// Applies `update` to one image. Alignments that no longer match the
    /// image's content hash are dropped afterwards.
    pub fn update_image<F>(&mut self, image_id: &str, update: F) -> Result<(), ProjectError>
    where
        F: FnOnce(&mut ImageSource),
    {
        let image = self.image_mut(image_id)?;
        let before = image.hashes.content_hash.clone();
        update(image);
        let changed = image.hashes.content_hash != before;

        if changed {
            let removed = self.prune_stale_alignments();
            log::debug!(
                "Content hash of {} changed, pruned {} alignments",
                image_id,
                removed
            );
        }
        Ok(())
    }

    pub fn set_perceptual_hash(&mut self, image_id: &str, hash: Option<String>) -> Result<(), ProjectError> {
        self.image_mut(image_id)?.hashes.perceptual_hash = hash;
        Ok(())
    }

    /// Removes the image and everything that references it.
    pub fn remove_image(&mut self, image_id: &str) -> Result<ImageSource, ProjectError> {
        let index = self
            .images
            .iter()
            .position(|image| image.id == image_id)
            .ok_or_else(|| ProjectError::ImageNotFound {
                image_id: image_id.to_string(),
            })?;
        let image = self.images.remove(index);

        self.detach_from_groups(&HashSet::from([image_id]));
        self.remove_alignments_for_image(image_id);
        if self.image_by_content_hash(image.content_hash()).is_none() {
            let hash = image.content_hash().to_string();
            self.annotations.retain(|a| !a.references_hash(&hash));
        }
        self.generations.remove(image_id);

        Ok(image)
    }

    /// Moves an image to `stage` and applies the cascade for that stage.
    pub fn set_stage(&mut self, image_id: &str, stage: WorkflowStage) -> Result<CascadeReport, ProjectError> {
        let content_hash = {
            let image = self.image_mut(image_id)?;
            image.workflow = WorkflowState::at(stage);
            image.hashes.content_hash.clone()
        };

        let plan = CascadePlan::for_stage(stage);
        let mut report = CascadeReport::default();

        if plan.groups {
            let (touched, deleted) = self.detach_from_groups(&HashSet::from([image_id]));
            report.groups_touched = touched;
            report.groups_deleted = deleted;
        }
        if plan.alignments {
            report.alignments_removed = self.remove_alignments_for_image(image_id);
        }
        if plan.annotations {
            let before = self.annotations.len();
            self.annotations.retain(|a| !a.references_hash(&content_hash));
            report.annotations_removed = before - self.annotations.len();
        }

        log::debug!("Image {} set to {}: {:?}", image_id, stage, report);
        Ok(report)
    }

    // Preparation

    /// Records a new preparation: bumps the image's generation, clears its
    /// perceptual hash and moves it to `prepared` (with the full cascade).
    pub fn begin_preparation(
        &mut self,
        image_id: &str,
        preparation: ImagePreparation,
    ) -> Result<(PreparationTicket, CascadeReport), ProjectError> {
        let content_hash = {
            let image = self.image_mut(image_id)?;
            image.preparation = Some(preparation);
            image.hashes.perceptual_hash = None;
            image.hashes.content_hash.clone()
        };

        let current = self
            .generations
            .entry(image_id.to_string())
            .or_default()
            .clone();
        let generation = current.fetch_add(1, Ordering::SeqCst) + 1;

        let report = self.set_stage(image_id, WorkflowStage::Prepared)?;

        Ok((
            PreparationTicket {
                image_id: image_id.to_string(),
                content_hash,
                generation,
                current,
            },
            report,
        ))
    }

    /// Stores the perceptual hash computed for `ticket`, unless a newer
    /// preparation has started since.
    pub fn finish_preparation(
        &mut self,
        ticket: &PreparationTicket,
        perceptual_hash: Option<String>,
    ) -> Result<(), ProjectError> {
        if !ticket.is_current() {
            return Err(ProjectError::Superseded {
                image_id: ticket.image_id.clone(),
                generation: ticket.generation,
            });
        }
        self.set_perceptual_hash(&ticket.image_id, perceptual_hash)
    }

    pub fn current_generation(&self, image_id: &str) -> u64 {
        self.generations
            .get(image_id)
            .map(|current| current.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    // Groups

    pub fn groups(&self) -> &[ImageGroup] {
        &self.groups
    }

    pub fn group(&self, group_id: &str) -> Option<&ImageGroup> {
        self.groups.iter().find(|group| group.id == group_id)
    }

    pub fn group_of(&self, image_id: &str) -> Option<&ImageGroup> {
        self.groups.iter().find(|group| group.contains(image_id))
    }

    fn group_mut(&mut self, group_id: &str) -> Result<&mut ImageGroup, ProjectError> {
        self.groups
            .iter_mut()
            .find(|group| group.id == group_id)
            .ok_or_else(|| ProjectError::GroupNotFound {
                group_id: group_id.to_string(),
            })
    }

    /// Inserts `group`, replacing any group with the same id.
    pub fn add_group(&mut self, group: ImageGroup) -> Result<(), ProjectError> {
        let invalid = |reason: &str| ProjectError::InvalidGroup {
            group_id: group.id.clone(),
            reason: reason.to_string(),
        };

        if group.image_ids.is_empty() {
            return Err(invalid("no members"));
        }
        if !group.contains(&group.base_image_id) {
            return Err(invalid("base image is not a member"));
        }
        if let Some(unknown) = group.image_ids.iter().find(|id| self.image(id).is_none()) {
            return Err(ProjectError::ImageNotFound {
                image_id: unknown.clone(),
            });
        }

        match self.groups.iter_mut().find(|existing| existing.id == group.id) {
            Some(existing) => *existing = group,
            None => self.groups.push(group),
        }
        Ok(())
    }

    pub fn remove_group(&mut self, group_id: &str) -> Option<ImageGroup> {
        let index = self.groups.iter().position(|group| group.id == group_id)?;
        Some(self.groups.remove(index))
    }

    /// Adds an image to a group, taking it out of any other group first.
    pub fn add_image_to_group(&mut self, group_id: &str, image_id: &str) -> Result<(), ProjectError> {
        if self.image(image_id).is_none() {
            return Err(ProjectError::ImageNotFound {
                image_id: image_id.to_string(),
            });
        }
        if self.group_mut(group_id)?.contains(image_id) {
            return Ok(());
        }

        let others: HashSet<&str> = HashSet::from([image_id]);
        self.groups = std::mem::take(&mut self.groups)
            .into_iter()
            .filter_map(|group| {
                if group.id == group_id {
                    Some(group)
                } else {
                    detach_members(group, &others)
                }
            })
            .collect();

        self.group_mut(group_id)?.image_ids.push(image_id.to_string());
        Ok(())
    }

    /// Removes one member. A group left empty is deleted; a group that lost
    /// its base gets the first remaining member as base.
    pub fn remove_image_from_group(&mut self, group_id: &str, image_id: &str) -> Result<GroupRemoval, ProjectError> {
        let index = self
            .groups
            .iter()
            .position(|group| group.id == group_id)
            .ok_or_else(|| ProjectError::GroupNotFound {
                group_id: group_id.to_string(),
            })?;

        if !self.groups[index].contains(image_id) {
            return Err(ProjectError::NotAMember {
                group_id: group_id.to_string(),
                image_id: image_id.to_string(),
            });
        }

        let group = self.groups.remove(index);
        match detach_members(group, &HashSet::from([image_id])) {
            Some(group) => {
                self.groups.insert(index, group);
                Ok(GroupRemoval::Updated)
            }
            None => Ok(GroupRemoval::Deleted),
        }
    }

    pub fn set_group_base_image(&mut self, group_id: &str, image_id: &str) -> Result<(), ProjectError> {
        let group = self.group_mut(group_id)?;
        if !group.contains(image_id) {
            return Err(ProjectError::NotAMember {
                group_id: group_id.to_string(),
                image_id: image_id.to_string(),
            });
        }
        group.base_image_id = image_id.to_string();
        Ok(())
    }

    pub fn set_group_locked(&mut self, group_id: &str, locked: bool) -> Result<(), ProjectError> {
        self.group_mut(group_id)?.locked = locked;
        Ok(())
    }

    /// Turns a list of image ids into a confirmed group.
    ///
    /// Ids are de-duplicated and unknown ids skipped. Every listed image is
    /// first taken out of whatever group held it, then the new group is
    /// created with the first id as base. Returns `None` when no known image
    /// remains.
    pub fn apply_proposal(&mut self, image_ids: &[String]) -> Option<ImageGroup> {
        let mut seen = HashSet::new();
        let members: Vec<String> = image_ids
            .iter()
            .filter(|id| {
                let known = self.image(id).is_some();
                if !known {
                    log::warn!("Skipping unknown image {} in proposal", id);
                }
                known
            })
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        let group = ImageGroup::from_members(members)?;
        let affected: HashSet<&str> = group.image_ids.iter().map(String::as_str).collect();
        let (touched, deleted) = self.detach_from_groups(&affected);
        log::debug!(
            "Confirmed {} with {} images ({} groups touched, {} deleted)",
            group.id,
            group.image_ids.len(),
            touched,
            deleted
        );

        self.groups.push(group.clone());
        Some(group)
    }

    /// Replaces a group with one singleton group per member.
    pub fn split_group(&mut self, group_id: &str) -> Result<Vec<ImageGroup>, ProjectError> {
        let group = self
            .remove_group(group_id)
            .ok_or_else(|| ProjectError::GroupNotFound {
                group_id: group_id.to_string(),
            })?;

        let singletons: Vec<ImageGroup> = group
            .image_ids
            .into_iter()
            .filter_map(|id| ImageGroup::from_members(vec![id]))
            .collect();
        self.groups.extend(singletons.iter().cloned());
        Ok(singletons)
    }

    /// Takes the image out of every group. Returns (groups touched, groups deleted).
    pub fn remove_from_all_groups(&mut self, image_id: &str) -> (usize, usize) {
        self.detach_from_groups(&HashSet::from([image_id]))
    }

    /// Images that belong to no group.
    pub fn ungrouped_image_ids(&self) -> Vec<String> {
        let grouped: HashSet<&str> = self
            .groups
            .iter()
            .flat_map(|group| group.image_ids.iter().map(String::as_str))
            .collect();
        self.images
            .iter()
            .filter(|image| !grouped.contains(image.id.as_str()))
            .map(|image| image.id.clone())
            .collect()
    }

    // Takes `removed` out of every group. Returns (groups touched, groups deleted).
    fn detach_from_groups(&mut self, removed: &HashSet<&str>) -> (usize, usize) {
        let mut touched = 0;
        let mut deleted = 0;

        self.groups = std::mem::take(&mut self.groups)
            .into_iter()
            .filter_map(|group| {
                if !group.image_ids.iter().any(|id| removed.contains(id.as_str())) {
                    return Some(group);
                }
                touched += 1;
                let kept = detach_members(group, removed);
                if kept.is_none() {
                    deleted += 1;
                }
                kept
            })
            .collect();

        (touched, deleted)
    }

    // Alignments

    pub fn alignments(&self) -> &[ImageAlignment] {
        &self.alignments
    }

    /// Records an alignment. Both images must exist and the recorded content
    /// hashes must match their current ones.
    pub fn add_alignment(&mut self, alignment: ImageAlignment) -> Result<(), ProjectError> {
        for (image_id, hash) in [
            (&alignment.source_image_id, &alignment.source_content_hash),
            (&alignment.target_image_id, &alignment.target_content_hash),
        ] {
            let image = self.image(image_id).ok_or_else(|| ProjectError::ImageNotFound {
                image_id: image_id.clone(),
            })?;
            if image.content_hash() != hash {
                return Err(ProjectError::StaleAlignment {
                    image_id: image_id.clone(),
                });
            }
        }

        self.alignments.push(alignment);
        Ok(())
    }

    pub fn alignments_for_image(&self, image_id: &str) -> Vec<&ImageAlignment> {
        self.alignments
            .iter()
            .filter(|alignment| alignment.references(image_id))
            .collect()
    }

    pub fn alignments_by_source_image(&self, image_id: &str) -> Vec<&ImageAlignment> {
        self.alignments
            .iter()
            .filter(|alignment| alignment.source_image_id == image_id)
            .collect()
    }

    pub fn remove_alignments_for_image(&mut self, image_id: &str) -> usize {
        let before = self.alignments.len();
        self.alignments.retain(|alignment| !alignment.references(image_id));
        before - self.alignments.len()
    }

    /// Drops alignments whose images are gone or whose recorded hashes no
    /// longer match.
    pub fn prune_stale_alignments(&mut self) -> usize {
        let current: HashMap<&str, &str> = self
            .images
            .iter()
            .map(|image| (image.id.as_str(), image.content_hash()))
            .collect();

        let before = self.alignments.len();
        self.alignments.retain(|alignment| {
            current.get(alignment.source_image_id.as_str()) == Some(&alignment.source_content_hash.as_str())
                && current.get(alignment.target_image_id.as_str())
                    == Some(&alignment.target_content_hash.as_str())
        });
        before - self.alignments.len()
    }

    // Annotations

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn add_annotation(&mut self, annotation: Annotation) {
        self.annotations.push(annotation);
    }

    pub fn remove_annotations_for_image(&mut self, image_id: &str) -> Result<usize, ProjectError> {
        let hash = self
            .image(image_id)
            .ok_or_else(|| ProjectError::ImageNotFound {
                image_id: image_id.to_string(),
            })?
            .content_hash()
            .to_string();

        let before = self.annotations.len();
        self.annotations.retain(|a| !a.references_hash(&hash));
        Ok(before - self.annotations.len())
    }

    /// `Mismatch` when any annotation references a content hash that no
    /// current image carries.
    pub fn annotation_status(&self) -> AnnotationStatus {
        if self.annotations.is_empty() {
            return AnnotationStatus::None;
        }

        let hashes: HashSet<&str> = self.images.iter().map(ImageSource::content_hash).collect();
        let valid = self.annotations.iter().all(|annotation| {
            hashes.contains(annotation.base_image_content_hash.as_str())
                && annotation
                    .compared_image_content_hash
                    .as_deref()
                    .map_or(true, |hash| hashes.contains(hash))
        });

        if valid {
            AnnotationStatus::Valid
        } else {
            AnnotationStatus::Mismatch
        }
    }
}

/// Filters `removed` out of a group. `None` when nothing is left; otherwise a
/// base that was removed moves to the first remaining member.
fn detach_members(group: ImageGroup, removed: &HashSet<&str>) -> Option<ImageGroup> {
    let remaining: Vec<String> = group
        .image_ids
        .into_iter()
        .filter(|id| !removed.contains(id.as_str()))
        .collect();

    let first = remaining.first()?.clone();
    let base_image_id = if remaining.contains(&group.base_image_id) {
        group.base_image_id
    } else {
        first
    };

    Some(ImageGroup {
        base_image_id,
        image_ids: remaining,
        ..group
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlignmentTransform, Dimensions, NormalizedRect, TransformKind};

    fn image(hash: &str) -> ImageSource {
        ImageSource::ingested(
            hash.to_string(),
            Dimensions {
                width: 100,
                height: 100,
            },
            Some(format!("{}.jpg", hash)),
            None,
        )
    }

    fn state_with(hashes: &[&str]) -> (ProjectState, Vec<String>) {
        let mut state = ProjectState::new();
        let ids = hashes
            .iter()
            .map(|hash| state.upsert_image_by_content_hash(image(hash)).0)
            .collect();
        (state, ids)
    }

    fn alignment(state: &ProjectState, source: &str, target: &str) -> ImageAlignment {
        ImageAlignment {
            source_image_id: source.to_string(),
            target_image_id: target.to_string(),
            source_content_hash: state.image(source).unwrap().content_hash().to_string(),
            target_content_hash: state.image(target).unwrap().content_hash().to_string(),
            confidence: 0.9,
            method: "manual".to_string(),
            transform: AlignmentTransform {
                kind: TransformKind::Affine,
                matrix: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            },
        }
    }

    fn annotation(hash: &str) -> Annotation {
        Annotation {
            base_image_content_hash: hash.to_string(),
            compared_image_content_hash: None,
            alignment_id: None,
            data: serde_json::json!({ "note": "rubric" }),
        }
    }

    fn preparation() -> ImagePreparation {
        ImagePreparation {
            rotation: 0.0,
            rect: NormalizedRect::FULL,
        }
    }

    #[test]
    fn test_upsert_by_content_hash() {
        let mut state = ProjectState::new();
        let (first, inserted) = state.upsert_image_by_content_hash(image("h1"));
        assert!(inserted);

        let mut again = image("h1");
        again.label = Some("renamed.jpg".into());
        let (second, inserted) = state.upsert_image_by_content_hash(again);

        assert!(!inserted);
        assert_eq!(first, second);
        assert_eq!(state.images().len(), 1);
        assert_eq!(state.image(&first).unwrap().label.as_deref(), Some("renamed.jpg"));
    }

    #[test]
    fn test_prepared_stage_leaves_no_groups() {
        let (mut state, ids) = state_with(&["a", "b", "c"]);
        state.apply_proposal(&ids).unwrap();

        let report = state.set_stage(&ids[0], WorkflowStage::Prepared).unwrap();
        assert_eq!(report.groups_touched, 1);
        assert!(state.group_of(&ids[0]).is_none());

        let group = state.group_of(&ids[1]).unwrap();
        assert_eq!(group.base_image_id, ids[1]);
        assert_eq!(group.image_ids, vec![ids[1].clone(), ids[2].clone()]);
    }

    #[test]
    fn test_emptied_group_is_deleted() {
        let (mut state, ids) = state_with(&["a"]);
        state.apply_proposal(&ids).unwrap();

        let report = state.set_stage(&ids[0], WorkflowStage::Ingested).unwrap();
        assert_eq!(report.groups_deleted, 1);
        assert!(state.groups().is_empty());
    }

    #[test]
    fn test_cascade_by_stage() {
        let (mut state, ids) = state_with(&["a", "b"]);
        state.apply_proposal(&ids).unwrap();
        let link = alignment(&state, &ids[0], &ids[1]);
        state.add_alignment(link).unwrap();
        state.add_annotation(annotation("a"));

        // Grouped keeps the group but drops alignments and annotations.
        let report = state.set_stage(&ids[0], WorkflowStage::Grouped).unwrap();
        assert_eq!(report.groups_touched, 0);
        assert_eq!(report.alignments_removed, 1);
        assert_eq!(report.annotations_removed, 1);
        assert!(state.group_of(&ids[0]).is_some());

        // Annotated drops nothing.
        state.add_annotation(annotation("a"));
        let report = state.set_stage(&ids[0], WorkflowStage::Annotated).unwrap();
        assert_eq!(report, CascadeReport::default());
        assert_eq!(state.annotations().len(), 1);
    }

    #[test]
    fn test_set_stage_unknown_image() {
        let mut state = ProjectState::new();
        assert!(matches!(
            state.set_stage("missing", WorkflowStage::Prepared),
            Err(ProjectError::ImageNotFound { .. })
        ));
    }

    #[test]
    fn test_apply_proposal_detaches_members() {
        let (mut state, ids) = state_with(&["a", "b", "c"]);
        let (a, b, c) = (ids[0].clone(), ids[1].clone(), ids[2].clone());
        state.apply_proposal(&[a.clone(), c.clone()]).unwrap();

        let group = state.apply_proposal(&[a.clone(), b.clone(), a.clone()]).unwrap();
        assert_eq!(group.image_ids, vec![a.clone(), b.clone()]);
        assert_eq!(group.base_image_id, a);

        let other = state.group_of(&c).unwrap();
        assert_eq!(other.image_ids, vec![c.clone()]);
        assert_eq!(other.base_image_id, c);
        assert_eq!(state.groups().len(), 2);
    }

    #[test]
    fn test_apply_proposal_skips_unknown_ids() {
        let (mut state, ids) = state_with(&["a"]);
        assert!(state.apply_proposal(&["ghost".to_string()]).is_none());

        let group = state
            .apply_proposal(&["ghost".to_string(), ids[0].clone()])
            .unwrap();
        assert_eq!(group.image_ids, vec![ids[0].clone()]);
    }

    #[test]
    fn test_split_group() {
        let (mut state, ids) = state_with(&["a", "b", "c"]);
        let group = state.apply_proposal(&ids).unwrap();

        let singletons = state.split_group(&group.id).unwrap();
        assert_eq!(singletons.len(), 3);
        assert!(state.group(&group.id).is_none());
        assert!(state.groups().iter().all(|g| g.image_ids.len() == 1));
        assert!(state.ungrouped_image_ids().is_empty());
    }

    #[test]
    fn test_remove_image_from_group_reassigns_base() {
        let (mut state, ids) = state_with(&["a", "b"]);
        let group = state.apply_proposal(&ids).unwrap();

        assert_eq!(
            state.remove_image_from_group(&group.id, &ids[0]).unwrap(),
            GroupRemoval::Updated
        );
        assert_eq!(state.group(&group.id).unwrap().base_image_id, ids[1]);

        assert_eq!(
            state.remove_image_from_group(&group.id, &ids[1]).unwrap(),
            GroupRemoval::Deleted
        );
        assert!(matches!(
            state.remove_image_from_group(&group.id, &ids[1]),
            Err(ProjectError::GroupNotFound { .. })
        ));
    }

    #[test]
    fn test_group_membership_edits() {
        let (mut state, ids) = state_with(&["a", "b", "c"]);
        let first = state.apply_proposal(&ids[..2]).unwrap();
        let second = state.apply_proposal(&ids[2..]).unwrap();

        assert!(matches!(
            state.set_group_base_image(&first.id, &ids[2]),
            Err(ProjectError::NotAMember { .. })
        ));
        state.set_group_base_image(&first.id, &ids[1]).unwrap();
        state.set_group_locked(&first.id, true).unwrap();
        assert!(state.group(&first.id).unwrap().locked);

        // Moving the only member of `second` deletes it.
        state.add_image_to_group(&first.id, &ids[2]).unwrap();
        assert!(state.group(&second.id).is_none());
        assert_eq!(state.group(&first.id).unwrap().image_ids.len(), 3);

        // Adding twice is a no-op.
        state.add_image_to_group(&first.id, &ids[2]).unwrap();
        assert_eq!(state.group(&first.id).unwrap().image_ids.len(), 3);
    }

    #[test]
    fn test_add_group_validates() {
        let (mut state, ids) = state_with(&["a", "b"]);
        let mut group = ImageGroup::from_members(vec![ids[0].clone()]).unwrap();
        group.base_image_id = ids[1].clone();
        assert!(matches!(state.add_group(group.clone()), Err(ProjectError::InvalidGroup { .. })));

        group.base_image_id = ids[0].clone();
        state.add_group(group.clone()).unwrap();
        state.add_group(group).unwrap();
        assert_eq!(state.groups().len(), 1);
    }

    #[test]
    fn test_alignment_hash_checks() {
        let (mut state, ids) = state_with(&["a", "b"]);
        let mut link = alignment(&state, &ids[0], &ids[1]);
        link.target_content_hash = "old".to_string();
        assert!(matches!(
            state.add_alignment(link),
            Err(ProjectError::StaleAlignment { .. })
        ));

        let link = alignment(&state, &ids[0], &ids[1]);
        state.add_alignment(link).unwrap();
        assert_eq!(state.alignments_by_source_image(&ids[0]).len(), 1);
        assert_eq!(state.alignments_for_image(&ids[1]).len(), 1);

        state
            .update_image(&ids[1], |image| image.hashes.content_hash = "new".to_string())
            .unwrap();
        assert!(state.alignments().is_empty());
    }

    #[test]
    fn test_preparation_generations() {
        let (mut state, ids) = state_with(&["a"]);
        let (old, _) = state.begin_preparation(&ids[0], preparation()).unwrap();
        let (new, _) = state.begin_preparation(&ids[0], preparation()).unwrap();

        assert!(!old.is_current());
        assert!(new.is_current());
        assert_eq!(state.current_generation(&ids[0]), 2);

        assert!(matches!(
            state.finish_preparation(&old, Some("stale".into())),
            Err(ProjectError::Superseded { .. })
        ));
        state.finish_preparation(&new, Some("fresh".into())).unwrap();

        let image = state.image(&ids[0]).unwrap();
        assert_eq!(image.hashes.perceptual_hash.as_deref(), Some("fresh"));
        assert_eq!(image.stage(), WorkflowStage::Prepared);
    }

    #[test]
    fn test_annotation_status() {
        let (mut state, ids) = state_with(&["a"]);
        assert_eq!(state.annotation_status(), AnnotationStatus::None);

        state.add_annotation(annotation("a"));
        assert_eq!(state.annotation_status(), AnnotationStatus::Valid);

        state.add_annotation(annotation("gone"));
        assert_eq!(state.annotation_status(), AnnotationStatus::Mismatch);

        assert_eq!(state.remove_annotations_for_image(&ids[0]).unwrap(), 1);
    }

    #[test]
    fn test_remove_image_cleans_references() {
        let (mut state, ids) = state_with(&["a", "b"]);
        state.apply_proposal(&ids).unwrap();
        let link = alignment(&state, &ids[0], &ids[1]);
        state.add_alignment(link).unwrap();
        state.add_annotation(annotation("a"));

        state.remove_image(&ids[0]).unwrap();

        assert!(state.alignments().is_empty());
        assert!(state.annotations().is_empty());
        assert_eq!(state.group_of(&ids[1]).unwrap().image_ids, vec![ids[1].clone()]);
    }

    #[test]
    fn test_snapshot_load_drops_invalid_entities() {
        let (state, ids) = state_with(&["a", "b"]);
        let mut snapshot = state.to_snapshot(ProjectSnapshot::new("test"));
        snapshot.groups.push(ImageGroup {
            id: "grp_empty".into(),
            base_image_id: String::new(),
            image_ids: Vec::new(),
            locked: false,
        });
        let mut link = alignment(&state, &ids[0], &ids[1]);
        link.source_content_hash = "stale".into();
        snapshot.alignments.push(link);

        let loaded = ProjectState::from_snapshot(snapshot);
        assert_eq!(loaded.images().len(), 2);
        assert!(loaded.groups().is_empty());
        assert!(loaded.alignments().is_empty());
    }

    #[test]
    fn test_snapshot_load_drops_orphan_annotations() {
        let (state, _) = state_with(&["a", "b"]);
        let mut snapshot = state.to_snapshot(ProjectSnapshot::new("test"));
        snapshot.annotations.push(annotation("a"));
        snapshot.annotations.push(annotation("nohash"));
        let mut compared = annotation("b");
        compared.compared_image_content_hash = Some("gone".into());
        snapshot.annotations.push(compared);
        let mut pair = annotation("b");
        pair.compared_image_content_hash = Some("a".into());
        snapshot.annotations.push(pair.clone());

        let loaded = ProjectState::from_snapshot(snapshot);
        assert_eq!(loaded.annotations(), &[annotation("a"), pair][..]);

        let empty = ProjectSnapshot {
            annotations: vec![annotation("nohash")],
            ..ProjectSnapshot::new("empty")
        };
        assert!(ProjectState::from_snapshot(empty).annotations().is_empty());
    }
}
