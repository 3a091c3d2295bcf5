//! Error codes for cache service responses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes returned by the cache service.
///
/// These codes are stable; the string form is written to the audit log and
/// the HTTP status is what clients act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing route parameter or form field.
    InvalidRequest,
    /// Folder key or relative path resolves outside its changeset root.
    InvalidPath,
    /// An archive entry would be written outside the extraction root.
    PathTraversal,
    /// The uploaded container could not be read.
    CorruptArchive,
    /// The uploaded container holds links or device entries.
    UnsupportedEntry,
    /// Missing changeset, archive or file.
    NotFound,
    /// The ticket is already linked to a folder.
    AlreadyLinked,
    /// No unlinked folder is left in the pool.
    NoUnlinkedFolder,
    /// Another upload for the changeset is in flight.
    UploadInProgress,
    /// Upload exceeds the configured size limit.
    PayloadTooLarge,
    /// The changeset tree is locked by another build or extract.
    Busy,
    /// The ledger store cannot be reached.
    StorageUnavailable,
    /// A ledger statement failed.
    QueryFailure,
    /// Disk error while building or extracting.
    IoFailure,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidPath => "INVALID_PATH",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::CorruptArchive => "CORRUPT_ARCHIVE",
            Self::UnsupportedEntry => "UNSUPPORTED_ENTRY",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyLinked => "ALREADY_LINKED",
            Self::NoUnlinkedFolder => "NO_UNLINKED_FOLDER",
            Self::UploadInProgress => "UPLOAD_IN_PROGRESS",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::Busy => "BUSY",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::QueryFailure => "QUERY_FAILURE",
            Self::IoFailure => "IO_FAILURE",
        }
    }

    /// HTTP status code reported for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest
            | Self::InvalidPath
            | Self::PathTraversal
            | Self::CorruptArchive
            | Self::UnsupportedEntry => 400,
            Self::NotFound => 404,
            Self::AlreadyLinked | Self::UploadInProgress => 409,
            Self::PayloadTooLarge => 413,
            Self::Busy | Self::NoUnlinkedFolder | Self::StorageUnavailable => 503,
            Self::QueryFailure | Self::IoFailure => 500,
        }
    }

    /// Whether the error was caused by the client's input rather than the server.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from decoding a request before it reaches the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing form field '{0}'")]
    MissingField(&'static str),

    #[error("missing route parameter '{0}'")]
    MissingParam(&'static str),
}

impl ProtocolError {
    /// All protocol errors are malformed requests.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidRequest
    }
}
