//! DAM Client Cache Protocol Types
//!
//! Route names, form fields, status payloads and the error-code registry
//! exchanged between the cache service and the client editors.

pub mod error;
pub mod forms;
pub mod ops;
pub mod status;

pub use error::{ErrorCode, ProtocolError};
pub use forms::{FormFields, LinkTicketForm, ReadyForm, RemoveWipForm, WipForm};
pub use status::ChangeStatus;

/// Literal value of the `theState` field that marks a changeset ready.
///
/// Any other value clears the ready flag.
pub const READY_TOKEN: &str = "ready";

/// Name of the per-changeset subdirectory that holds transient archives.
pub const RESERVED_DIR: &str = "downloads";

/// Component name recorded on audit log entries.
pub const COMPONENT_NAME: &str = "dam-cache";

/// Returns true if a ready signal value classifies as "ready".
pub fn is_ready_token(state: &str) -> bool {
    state == READY_TOKEN
}
