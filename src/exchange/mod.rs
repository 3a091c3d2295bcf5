//! Exchange coordinator
//!
//! Serves precache archives, accepts postcache uploads and carries out the
//! ledger-backed operations behind the HTTP surface. All state lives in one
//! [`ExchangeContext`] built at startup and shared behind an `Arc`.
//!
//! Every method here blocks on the file system or the ledger; async callers
//! run them on the blocking pool.

mod mime;
mod upload;

use mime::sniff_file;
pub use upload::{UploadOutcome, UploadSession};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dcc_ledger::{Ledger, LedgerError, LinkRequest, WipAsset};
use dcc_protocol::{
    is_ready_token, ChangeStatus, ErrorCode, LinkTicketForm, ProtocolError, ReadyForm,
    RemoveWipForm, WipForm,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::bundle::{BundleError, PrecacheArchive, PrecacheBuilder};
use crate::config::ServerConfig;
use crate::extract::{ExtractError, PartialExtract};
use crate::lock::{ChangesetLock, LockError};
use crate::paths::{resolve_within, validate_folder_key, ArchiveRole, PathError, PathResolver};
use crate::search::SearchError;

/// Errors surfaced by coordinator operations
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Extract(#[from] PartialExtract),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ExchangeError {
    /// Stable error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Path(PathError::InvalidPath { .. }) => ErrorCode::InvalidPath,
            Self::Path(PathError::Io(_)) => ErrorCode::IoFailure,
            Self::Bundle(BundleError::MissingRoot(_)) => ErrorCode::NotFound,
            Self::Bundle(_) => ErrorCode::IoFailure,
            Self::Extract(partial) => match &partial.source {
                ExtractError::CorruptArchive(_) => ErrorCode::CorruptArchive,
                ExtractError::PathTraversal(_) => ErrorCode::PathTraversal,
                ExtractError::UnsupportedEntry { .. } => ErrorCode::UnsupportedEntry,
                ExtractError::Io(_) => ErrorCode::IoFailure,
            },
            Self::Lock(LockError::Timeout { .. }) => ErrorCode::Busy,
            Self::Lock(LockError::Path(PathError::InvalidPath { .. })) => ErrorCode::InvalidPath,
            Self::Lock(_) => ErrorCode::IoFailure,
            Self::Ledger(e) => e.code(),
            Self::Search(SearchError::Glob(_) | SearchError::Regex(_)) => ErrorCode::InvalidRequest,
            Self::Search(_) => ErrorCode::IoFailure,
            Self::Protocol(e) => e.code(),
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::Io(_) => ErrorCode::IoFailure,
        }
    }

    /// Short reason for clients.
    ///
    /// Extraction failures report only the code; the detail goes to the
    /// audit log.
    pub fn client_reason(&self) -> String {
        match self {
            Self::Extract(_) => self.code().as_str().to_string(),
            _ => format!("{}: {}", self.code(), self),
        }
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// A file ready to stream as an attachment
#[derive(Debug, Clone)]
pub struct Download {
    pub path: PathBuf,
    /// Bare file name for the `Content-Disposition` header
    pub file_name: String,
    pub content_type: &'static str,
    pub len: u64,
}

impl Download {
    /// Sniff a file's content type and length without loading it.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let (content_type, len) = sniff_file(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            file_name,
            content_type,
            len,
        })
    }
}

/// Shared service state
#[derive(Debug)]
pub struct ExchangeContext {
    config: ServerConfig,
    ledger: Arc<Ledger>,
    audit: AuditLog,
    paths: PathResolver,
}

impl ExchangeContext {
    pub fn new(config: ServerConfig, ledger: Arc<Ledger>) -> Self {
        let audit = AuditLog::new(Arc::clone(&ledger));
        let paths = PathResolver::new(config.changeset_path.clone());
        Self {
            config,
            ledger,
            audit,
            paths,
        }
    }

    /// Open the configured ledger and build the context.
    pub fn open(config: ServerConfig) -> ExchangeResult<Self> {
        let ledger = Ledger::open(&config.database_path)?;
        Ok(Self::new(config, Arc::new(ledger)))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// Literal caching-enabled flag
    pub fn caching_enabled(&self) -> &str {
        &self.config.caching_enabled
    }

    /// Add an unlinked folder to the pool and create its tree.
    ///
    /// Returns false if the folder was already registered.
    pub fn register_folder(&self, folder: &str) -> ExchangeResult<bool> {
        let root = self.paths.create_changeset(folder)?;
        let added = self.ledger.register_folder(folder)?;
        if added {
            info!(folder, root = %root.display(), "changeset folder registered");
        }
        Ok(added)
    }

    /// Clear `uploading` flags left by a process that died mid-upload.
    ///
    /// Call once at startup, before any upload is accepted.
    pub fn recover_uploads(&self) -> ExchangeResult<Vec<String>> {
        let folders = self.ledger.clear_stale_uploads()?;
        for folder in &folders {
            warn!(folder = %folder, "clearing upload left open by a previous run");
            self.audit
                .error(folder, "upload bracket left open by a previous run was cleared");
        }
        Ok(folders)
    }

    /// Build a precache archive for a linked changeset.
    pub fn build_precache(&self, folder: &str) -> ExchangeResult<PrecacheArchive> {
        let result = self.build_precache_inner(folder);
        if let Err(e) = &result {
            self.audit
                .error(folder, format!("precache build failed: {}", e));
        }
        result
    }

    fn build_precache_inner(&self, folder: &str) -> ExchangeResult<PrecacheArchive> {
        let root = self.paths.changeset_root(folder)?;
        let changeset = self
            .ledger
            .changeset_for_folder(folder)?
            .ok_or_else(|| ExchangeError::NotFound(format!("no changeset for folder {}", folder)))?;
        if !changeset.state().is_fetchable() {
            return Err(ExchangeError::NotFound(format!(
                "changeset {} is not active",
                changeset.ticket
            )));
        }
        if !root.is_dir() {
            return Err(ExchangeError::NotFound(format!(
                "changeset tree missing for folder {}",
                folder
            )));
        }

        let _lock = ChangesetLock::acquire(&self.paths, folder, self.config.lock_timeout())?;
        let output = self.paths.new_archive_path(folder, ArchiveRole::Precache)?;
        let archive = PrecacheBuilder::new(root).build(&output)?;

        info!(
            folder,
            archive = %archive.path.display(),
            entries = archive.entries.len(),
            size = archive.size,
            "precache built"
        );
        self.audit.info(
            folder,
            format!(
                "precache {} built: {} entries, {} bytes, sha256 {}",
                archive.file_name(),
                archive.entries.len(),
                archive.size,
                archive.sha256
            ),
        );
        Ok(archive)
    }

    /// Build a precache archive and load it for sending.
    pub fn precache_download(&self, folder: &str) -> ExchangeResult<Download> {
        let archive = self.build_precache(folder)?;
        Ok(Download::from_file(&archive.path)?)
    }

    /// The configured support archive.
    pub fn support_download(&self) -> ExchangeResult<Download> {
        let path = &self.config.support_archive_path;
        match Download::from_file(path) {
            Ok(download) => Ok(download),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ExchangeError::NotFound(
                "support archive not found".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Stored file path for a template, empty when unknown.
    pub fn template_path(&self, template_id: &str) -> ExchangeResult<String> {
        Ok(self
            .ledger
            .template_path(template_id)?
            .unwrap_or_default())
    }

    /// Status flags of a ticket; unknown tickets are all false.
    pub fn change_status(&self, ticket: &str) -> ExchangeResult<ChangeStatus> {
        Ok(self.ledger.query_status(ticket)?)
    }

    /// Link a ticket to the first unlinked folder.
    pub fn link_ticket(&self, form: &LinkTicketForm) -> ExchangeResult<String> {
        let request = LinkRequest {
            ticket: form.ticket.clone(),
            description: form.description.clone(),
            lead: form.lead.clone(),
            assignee: form.assignee.clone(),
        };
        match self.ledger.link_changeset(&request) {
            Ok(folder) => {
                self.audit
                    .info(&form.ticket, format!("ticket linked to folder {}", folder));
                Ok(folder)
            }
            Err(e) => {
                self.audit
                    .error(&form.ticket, format!("linkTicket failed: {}", e));
                Err(e.into())
            }
        }
    }

    /// Apply a client readiness signal; returns the rows updated.
    pub fn set_ready(&self, form: &ReadyForm) -> ExchangeResult<usize> {
        validate_folder_key(&form.folder)?;
        let ready = is_ready_token(&form.state);
        match self.ledger.set_ready(&form.folder, ready) {
            Ok(updated) => {
                self.audit.info(
                    &form.folder,
                    format!("ready flag set to {} ({} changesets)", ready, updated),
                );
                Ok(updated)
            }
            Err(e) => {
                self.audit
                    .error(&form.folder, format!("ready update failed: {}", e));
                Err(e.into())
            }
        }
    }

    /// Record a checked-out asset at `<changeset>/<template name>`.
    pub fn record_wip(&self, form: &WipForm) -> ExchangeResult<WipAsset> {
        let root = self.paths.changeset_root(&form.folder)?;
        let full_path = resolve_within(&root, Path::new(&normalize_separators(&form.template_name)))?;
        let asset = WipAsset::checkout(
            form.folder.as_str(),
            form.template_id.as_str(),
            full_path.to_string_lossy(),
            form.template_name.as_str(),
        );
        match self.ledger.record_wip(&asset) {
            Ok(()) => Ok(asset),
            Err(e) => {
                self.audit
                    .error(&form.folder, format!("WIP check-out failed: {}", e));
                Err(e.into())
            }
        }
    }

    /// Delete a checked-out asset's file and row.
    ///
    /// Returns false when no row exists. Only files inside the changeset
    /// tree are deleted.
    pub fn remove_wip(&self, form: &RemoveWipForm) -> ExchangeResult<bool> {
        let root = self.paths.changeset_root(&form.folder)?;
        let Some(stored) = self.ledger.wip_path(&form.folder, &form.template_id)? else {
            return Ok(false);
        };

        let target = confine(&root, &stored).map_err(|e| {
            self.audit.error(
                &form.folder,
                format!("refusing to remove {} outside changeset: {}", stored, e),
            );
            e
        })?;
        self.audit
            .debug(&form.folder, format!("removing WIP file {}", target.display()));
        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %target.display(), "WIP file already gone");
            }
            Err(e) => return Err(e.into()),
        }

        self.ledger.remove_wip(&form.folder, &form.template_id)?;
        Ok(true)
    }

    /// Open the upload bracket for a folder.
    ///
    /// The returned session owns the bracket; dropping it without completing
    /// releases the bracket.
    pub fn begin_upload(&self, folder: &str) -> ExchangeResult<UploadSession> {
        let root = self.paths.changeset_root(folder)?;
        if let Err(e) = self.ledger.begin_upload(folder) {
            self.audit
                .error(folder, format!("upload refused: {}", e));
            return Err(e.into());
        }
        let session = UploadSession::new(
            Arc::clone(&self.ledger),
            self.audit.clone(),
            self.paths.clone(),
            folder.to_string(),
            root,
            self.config.lock_timeout(),
        );
        let archive_path = self.paths.new_archive_path(folder, ArchiveRole::Postcache)?;
        Ok(session.with_archive_path(archive_path))
    }

    /// Upload limit, `None` when unlimited
    pub fn upload_limit(&self) -> Option<u64> {
        self.config.upload_limit()
    }
}

fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Map a stored absolute path back inside `root`.
fn confine(root: &Path, stored: &str) -> Result<PathBuf, PathError> {
    let stored = PathBuf::from(normalize_separators(stored));
    let relative = stored
        .strip_prefix(root)
        .map_err(|_| PathError::InvalidPath {
            path: stored.to_string_lossy().into_owned(),
            reason: "outside changeset root",
        })?;
    resolve_within(root, relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> ExchangeContext {
        let config = ServerConfig {
            changeset_path: dir.path().join("changesets"),
            support_archive_path: dir.path().join("support.zip"),
            lock_timeout_secs: 1,
            ..ServerConfig::default()
        };
        ExchangeContext::new(config, Arc::new(Ledger::open_in_memory().unwrap()))
    }

    fn link(ctx: &ExchangeContext, ticket: &str) -> String {
        ctx.link_ticket(&LinkTicketForm {
            ticket: ticket.to_string(),
            description: String::new(),
            lead: String::new(),
            assignee: String::new(),
        })
        .unwrap()
    }

    #[test]
    fn test_error_codes() {
        let err = ExchangeError::Lock(LockError::Timeout {
            folder: "F1".to_string(),
            waited: std::time::Duration::from_secs(1),
        });
        assert_eq!(err.code(), ErrorCode::Busy);
        assert!(err.client_reason().contains("F1"));

        let err = ExchangeError::from(PartialExtract::from(ExtractError::PathTraversal(
            "../x".to_string(),
        )));
        assert_eq!(err.code(), ErrorCode::PathTraversal);
        assert_eq!(err.client_reason(), "PATH_TRAVERSAL");

        let err = ExchangeError::PayloadTooLarge { limit: 10 };
        assert_eq!(err.code(), ErrorCode::PayloadTooLarge);
        assert!(err.client_reason().starts_with("PAYLOAD_TOO_LARGE: "));

        let err = ExchangeError::from(LedgerError::UploadInProgress("F1".to_string()));
        assert_eq!(err.code(), ErrorCode::UploadInProgress);
    }

    #[test]
    fn test_register_creates_tree() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        assert!(ctx.register_folder("F1").unwrap());
        assert!(!ctx.register_folder("F1").unwrap());
        assert!(dir.path().join("changesets/F1/downloads").is_dir());
        assert!(matches!(
            ctx.register_folder("../F2").unwrap_err().code(),
            ErrorCode::InvalidPath
        ));
    }

    #[test]
    fn test_precache_requires_linked_changeset() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.register_folder("F1").unwrap();

        let err = ctx.build_precache("F1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        link(&ctx, "JIRA-1");
        let archive = ctx.build_precache("F1").unwrap();
        assert!(archive.entries.is_empty());
        assert!(archive.file_name().ends_with("-precache.zip"));

        let logs = ctx.ledger().recent_logs(1).unwrap();
        assert!(logs[0].message.contains("precache"));
    }

    #[test]
    fn test_precache_download_sniffs_zip() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.register_folder("F1").unwrap();
        link(&ctx, "JIRA-1");
        fs::write(dir.path().join("changesets/F1/a.xml"), "<a/>").unwrap();

        let download = ctx.precache_download("F1").unwrap();
        assert_eq!(download.content_type, "application/zip");
        assert!(download.file_name.ends_with("-precache.zip"));
        assert!(!download.file_name.contains('/'));
        assert_eq!(download.len, fs::metadata(&download.path).unwrap().len());
    }

    #[test]
    fn test_precache_busy_while_locked() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.register_folder("F1").unwrap();
        link(&ctx, "JIRA-1");

        let _held =
            ChangesetLock::acquire(ctx.paths(), "F1", std::time::Duration::from_secs(1)).unwrap();
        let err = ctx.build_precache("F1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Busy);
    }

    #[test]
    fn test_support_download() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        assert_eq!(ctx.support_download().unwrap_err().code(), ErrorCode::NotFound);

        fs::write(dir.path().join("support.zip"), b"PK\x03\x04data").unwrap();
        let download = ctx.support_download().unwrap();
        assert_eq!(download.file_name, "support.zip");
        assert_eq!(download.content_type, "application/zip");
        assert_eq!(download.len, 8);
    }

    #[test]
    fn test_template_path_empty_when_unknown() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        assert_eq!(ctx.template_path("nope").unwrap(), "");

        ctx.ledger().upsert_template("t1", "/mirror/t1.oet").unwrap();
        assert_eq!(ctx.template_path("t1").unwrap(), "/mirror/t1.oet");
    }

    #[test]
    fn test_ready_signal() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.register_folder("F1").unwrap();
        link(&ctx, "JIRA-1");

        let form = ReadyForm {
            state: "ready".to_string(),
            folder: "F1".to_string(),
        };
        assert_eq!(ctx.set_ready(&form).unwrap(), 1);
        assert!(ctx.change_status("JIRA-1").unwrap().ready);

        let form = ReadyForm {
            state: "READY".to_string(),
            folder: "F1".to_string(),
        };
        ctx.set_ready(&form).unwrap();
        assert!(!ctx.change_status("JIRA-1").unwrap().ready);
    }

    #[test]
    fn test_wip_checkout_and_remove() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.register_folder("F1").unwrap();
        let file = dir.path().join("changesets/F1/t1.oet");
        fs::write(&file, "body").unwrap();

        let asset = ctx
            .record_wip(&WipForm {
                folder: "F1".to_string(),
                template_id: "t1".to_string(),
                template_name: "t1.oet".to_string(),
            })
            .unwrap();
        assert_eq!(PathBuf::from(&asset.full_file_path), file);
        assert_eq!(asset.filename, "t1.oet");

        let form = RemoveWipForm {
            folder: "F1".to_string(),
            template_id: "t1".to_string(),
        };
        assert!(ctx.remove_wip(&form).unwrap());
        assert!(!file.exists());
        assert!(!ctx.remove_wip(&form).unwrap());
    }

    #[test]
    fn test_wip_name_cannot_escape() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let err = ctx
            .record_wip(&WipForm {
                folder: "F1".to_string(),
                template_id: "t1".to_string(),
                template_name: "..\\..\\etc\\passwd".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPath);
    }

    #[test]
    fn test_remove_wip_refuses_outside_paths() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let outside = dir.path().join("outside.txt");
        fs::write(&outside, "keep").unwrap();
        ctx.ledger()
            .record_wip(&WipAsset::checkout(
                "F1",
                "t1",
                outside.to_string_lossy(),
                "outside.txt",
            ))
            .unwrap();

        let err = ctx
            .remove_wip(&RemoveWipForm {
                folder: "F1".to_string(),
                template_id: "t1".to_string(),
            })
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::InvalidPath);
        assert!(outside.exists());
    }

    #[test]
    fn test_link_failure_is_audited() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let err = ctx
            .link_ticket(&LinkTicketForm {
                ticket: "JIRA-9".to_string(),
                description: String::new(),
                lead: String::new(),
                assignee: String::new(),
            })
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::NoUnlinkedFolder);
        let logs = ctx.ledger().recent_logs(1).unwrap();
        assert_eq!(logs[0].ticket, "JIRA-9");
    }

    #[test]
    fn test_recover_uploads_after_crash() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("dcc.sqlite");
        let config = ServerConfig {
            changeset_path: dir.path().join("changesets"),
            database_path: db.clone(),
            lock_timeout_secs: 1,
            ..ServerConfig::default()
        };

        {
            let ctx = ExchangeContext::open(config.clone()).unwrap();
            ctx.register_folder("F1").unwrap();
            link(&ctx, "JIRA-1");
            // A crash never runs the session's drop
            std::mem::forget(ctx.begin_upload("F1").unwrap());
        }

        let ctx = ExchangeContext::open(config).unwrap();
        assert_eq!(ctx.begin_upload("F1").unwrap_err().code(), ErrorCode::UploadInProgress);

        assert_eq!(ctx.recover_uploads().unwrap(), vec!["F1".to_string()]);
        assert!(!ctx.change_status("JIRA-1").unwrap().uploading);
        ctx.begin_upload("F1").unwrap();
    }
}
