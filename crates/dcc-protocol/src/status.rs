//! Change status payload returned by `change_status`.

use serde::{Deserialize, Serialize};

/// Status flags of a changeset as seen by clients.
///
/// Serializes as `{"active":bool,"uploading":bool,"ready":bool}`. An unknown
/// ticket reports the default (all false).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatus {
    pub active: bool,
    pub uploading: bool,
    pub ready: bool,
}

impl ChangeStatus {
    /// Render as the compact JSON body sent to clients.
    pub fn to_json(&self) -> String {
        format!(
            r#"{{"active":{},"uploading":{},"ready":{}}}"#,
            self.active, self.uploading, self.ready
        )
    }
}
