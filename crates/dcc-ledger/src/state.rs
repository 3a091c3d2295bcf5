//! Changeset lifecycle state machine
//!
//! States: DRAFT → ACTIVE ⇄ READY, with UPLOADING entered from ACTIVE or
//! READY while a postcache upload is in flight.
//!
//! The store keeps three independent flags (`active`, `uploading`,
//! `state_ready`); the state is derived from them.

use dcc_protocol::ChangeStatus;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangesetState {
    /// Not linked to a ticket, or deactivated externally
    Draft,
    /// Linked and usable
    Active,
    /// A postcache upload is being expanded into the tree
    Uploading,
    /// Signalled ready for downstream ingestion
    Ready,
}

impl ChangesetState {
    /// Derive the state from the persisted flags.
    ///
    /// `uploading` takes precedence over `ready`, and an inactive changeset is
    /// a draft whatever its other flags say.
    pub fn from_status(status: &ChangeStatus) -> Self {
        if !status.active {
            ChangesetState::Draft
        } else if status.uploading {
            ChangesetState::Uploading
        } else if status.ready {
            ChangesetState::Ready
        } else {
            ChangesetState::Active
        }
    }

    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: ChangesetState) -> bool {
        match (self, target) {
            // Linking
            (ChangesetState::Draft, ChangesetState::Active) => true,

            // Upload bracket
            (ChangesetState::Active, ChangesetState::Uploading) => true,
            (ChangesetState::Ready, ChangesetState::Uploading) => true,
            (ChangesetState::Uploading, ChangesetState::Active) => true,
            (ChangesetState::Uploading, ChangesetState::Ready) => true,

            // Ready signal
            (ChangesetState::Active, ChangesetState::Ready) => true,
            (ChangesetState::Ready, ChangesetState::Active) => true,

            _ => false,
        }
    }

    /// Whether a precache may be served in this state.
    pub fn is_fetchable(&self) -> bool {
        !matches!(self, ChangesetState::Draft)
    }
}
