use crate::core::project::ProjectState;
use crate::models::{GroupingProposal, ImageGroup, ImageSource};
use std::collections::HashSet;

pub const SPLIT_REASON: &str = "Split from suggestion";
const MANUAL_EDIT_SUFFIX: &str = " (manually edited)";

/// Transient grouping suggestions under review.
///
/// Proposals never touch the project until `confirm` turns one into a group.
#[derive(Debug, Clone, Default)]
pub struct ProposalSet {
    proposals: Vec<GroupingProposal>,
}

impl ProposalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn proposals(&self) -> &[GroupingProposal] {
        &self.proposals
    }

    pub fn get(&self, proposal_id: &str) -> Option<&GroupingProposal> {
        self.proposals.iter().find(|proposal| proposal.id == proposal_id)
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    /// Replaces everything with the output of a strategy run.
    pub fn replace(&mut self, proposals: Vec<GroupingProposal>) {
        self.proposals = proposals;
    }

    pub fn clear(&mut self) {
        self.proposals.clear();
    }

    /// Seeds one proposal per image, but only into an empty set.
    pub fn initialise_single_image_proposals(&mut self, images: &[ImageSource]) -> bool {
        if !self.proposals.is_empty() {
            return false;
        }
        self.proposals = images
            .iter()
            .map(|image| GroupingProposal {
                id: format!("single_{}", image.id),
                image_ids: vec![image.id.clone()],
                reason: Some("Initial state".to_string()),
                confidence: Some(1.0),
            })
            .collect();
        true
    }

    pub fn discard(&mut self, proposal_id: &str) -> Option<GroupingProposal> {
        let index = self
            .proposals
            .iter()
            .position(|proposal| proposal.id == proposal_id)?;
        Some(self.proposals.remove(index))
    }

    /// Adds a singleton proposal for `image_id` unless one already exists.
    pub fn ensure_single_image_proposal(&mut self, image_id: &str, reason: &str) -> bool {
        let exists = self
            .proposals
            .iter()
            .any(|proposal| proposal.image_ids.len() == 1 && proposal.image_ids[0] == image_id);
        if exists {
            return false;
        }
        self.proposals
            .push(GroupingProposal::new(vec![image_id.to_string()], reason).with_confidence(1.0));
        true
    }

    /// Takes one image out of a proposal and gives it its own singleton
    /// proposal. A proposal left empty is dropped; otherwise its reason is
    /// marked as manually edited.
    pub fn ungroup_image_from_proposal(&mut self, proposal_id: &str, image_id: &str) -> bool {
        let Some(index) = self
            .proposals
            .iter()
            .position(|proposal| proposal.id == proposal_id)
        else {
            return false;
        };

        let proposal = &mut self.proposals[index];
        let before = proposal.image_ids.len();
        proposal.image_ids.retain(|id| id != image_id);
        if proposal.image_ids.len() == before {
            return false;
        }

        if proposal.image_ids.is_empty() {
            self.proposals.remove(index);
        } else {
            proposal.reason = Some(match proposal.reason.take() {
                Some(reason) if reason.ends_with(MANUAL_EDIT_SUFFIX) => reason,
                Some(reason) => format!("{}{}", reason, MANUAL_EDIT_SUFFIX),
                None => "Manually edited".to_string(),
            });
        }

        self.ensure_single_image_proposal(image_id, SPLIT_REASON);
        true
    }

    /// Confirms a proposal as a group in `project`, then drops every
    /// proposal that shares an image with it.
    pub fn confirm(&mut self, proposal_id: &str, project: &mut ProjectState) -> Option<ImageGroup> {
        let proposal = self.get(proposal_id)?.clone();
        let group = project.apply_proposal(&proposal.image_ids)?;

        let confirmed: HashSet<&str> = group.image_ids.iter().map(String::as_str).collect();
        self.proposals.retain(|other| {
            other.id != proposal.id
                && !other
                    .image_ids
                    .iter()
                    .any(|id| confirmed.contains(id.as_str()))
        });

        Some(group)
    }

    /// Image ids that appear in at least one proposal.
    pub fn proposed_image_ids(&self) -> HashSet<&str> {
        self.proposals
            .iter()
            .flat_map(|proposal| proposal.image_ids.iter().map(String::as_str))
            .collect()
    }
}
