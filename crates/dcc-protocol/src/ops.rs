//! Route names understood by the cache service.
//!
//! Routes are matched by substring against the request path, and GET routes
//! carry a single positional parameter after a comma, e.g.
//! `GET /createArchive,F1`.

/// GET route markers.
pub mod names {
    pub const IS_CACHING_ENABLED: &str = "isCachingEnabled";
    pub const CREATE_ARCHIVE: &str = "createArchive";
    pub const TRANSFORM_SUPPORT: &str = "transform_support";
    pub const TEMPLATE_BY_ID: &str = "templatebyid";
    pub const CHANGE_STATUS: &str = "change_status";
}

/// POST route markers.
pub mod post {
    pub const UPLOAD: &str = "/upload";
    pub const REMOVE_WIP: &str = "/RemoveWIP";
    pub const WIP: &str = "/WIP";
    pub const READY: &str = "/ready";
    pub const LINK_TICKET: &str = "/linkTicket";
}

/// Separator between the route and its positional parameters.
pub const PARAM_SEPARATOR: char = ',';

/// Extract the first positional parameter from a request target.
///
/// `"/createArchive,F1"` yields `Some("F1")`. Empty parameters yield `None`.
pub fn positional_param(target: &str) -> Option<&str> {
    let mut parts = target.split(PARAM_SEPARATOR);
    parts.next()?;
    let param = parts.next()?;
    // A query string never belongs to the parameter.
    let param = param.split('?').next().unwrap_or(param).trim();
    if param.is_empty() {
        None
    } else {
        Some(param)
    }
}
