//! Request routing
//!
//! Routes are matched by substring on the request path, in table order. GET
//! routes that take an argument read it positionally after a comma, e.g.
//! `/createArchive,F1`.

use dcc_protocol::ops::{names, positional_param, post};
use dcc_protocol::ProtocolError;
use hyper::Method;

/// A recognised request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    CachingEnabled,
    CreateArchive { folder: String },
    TransformSupport,
    TemplateById { template_id: String },
    ChangeStatus { ticket: String },
    Upload { folder: String },
    RemoveWip,
    Wip,
    Ready,
    LinkTicket,
}

impl Route {
    /// Match a request.
    ///
    /// `target` is the raw request target (path and query). Returns
    /// `Ok(None)` for unknown routes and an error when a route's positional
    /// parameter is missing.
    pub fn parse(method: &Method, target: &str) -> Result<Option<Self>, ProtocolError> {
        let path = target.split('?').next().unwrap_or_default();
        let param = |name: &'static str| {
            positional_param(path)
                .map(str::to_string)
                .ok_or(ProtocolError::MissingParam(name))
        };

        let route = if *method == Method::GET {
            if path.contains(names::IS_CACHING_ENABLED) {
                Route::CachingEnabled
            } else if path.contains(names::CREATE_ARCHIVE) {
                Route::CreateArchive {
                    folder: param("folder")?,
                }
            } else if path.contains(names::TRANSFORM_SUPPORT) {
                Route::TransformSupport
            } else if path.contains(names::TEMPLATE_BY_ID) {
                Route::TemplateById {
                    template_id: param("template id")?,
                }
            } else if path.contains(names::CHANGE_STATUS) {
                Route::ChangeStatus {
                    ticket: param("ticket")?,
                }
            } else {
                return Ok(None);
            }
        } else if *method == Method::POST {
            if path.contains(post::UPLOAD) {
                Route::Upload {
                    folder: param("folder")?,
                }
            } else if path.contains(post::REMOVE_WIP) {
                Route::RemoveWip
            } else if path.contains(post::WIP) {
                Route::Wip
            } else if path.contains(post::READY) {
                Route::Ready
            } else if path.contains(post::LINK_TICKET) {
                Route::LinkTicket
            } else {
                return Ok(None);
            }
        } else {
            return Ok(None);
        };

        Ok(Some(route))
    }

    /// Whether the route carries an url-encoded form body
    pub fn takes_form(&self) -> bool {
        matches!(
            self,
            Route::RemoveWip | Route::Wip | Route::Ready | Route::LinkTicket
        )
    }
}
