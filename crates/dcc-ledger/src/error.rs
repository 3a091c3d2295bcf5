//! Ledger errors.

use dcc_protocol::ErrorCode;
use thiserror::Error;

use crate::state::ChangesetState;

/// Ledger result type
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("ledger query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("ticket {ticket} is already linked to folder {folder}")]
    AlreadyLinked { ticket: String, folder: String },

    #[error("no unlinked changeset folder is available")]
    NoUnlinkedFolder,

    #[error("an upload is already in progress for folder {0}")]
    UploadInProgress(String),

    #[error("no changeset is linked to folder {0}")]
    NotFound(String),

    #[error("invalid changeset transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ChangesetState,
        to: ChangesetState,
    },
}

impl LedgerError {
    /// Stable error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
            Self::Query(_) => ErrorCode::QueryFailure,
            Self::AlreadyLinked { .. } => ErrorCode::AlreadyLinked,
            Self::NoUnlinkedFolder => ErrorCode::NoUnlinkedFolder,
            Self::UploadInProgress(_) => ErrorCode::UploadInProgress,
            Self::NotFound(_) => ErrorCode::NotFound,
            // Inactive changesets are reported the same as absent ones.
            Self::InvalidTransition { .. } => ErrorCode::NotFound,
        }
    }
}
