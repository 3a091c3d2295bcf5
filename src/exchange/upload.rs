//! Postcache upload bracket.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dcc_ledger::Ledger;
use http_body_util::BodyExt;
use hyper::body::Body;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::{ExchangeError, ExchangeResult};
use crate::audit::AuditLog;
use crate::extract::Extractor;
use crate::lock::ChangesetLock;
use crate::paths::PathResolver;

/// Result of a completed upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Bytes persisted from the request body
    pub bytes: u64,
    /// Entries expanded into the changeset tree
    pub expanded: Vec<String>,
    /// Where the postcache archive was kept
    pub archive_path: PathBuf,
}

impl UploadOutcome {
    /// Body returned to the client
    pub fn message(&self) -> String {
        format!("{} bytes are received.\n", self.bytes)
    }
}

/// An open upload bracket for one folder.
///
/// The ledger's `uploading` flag is set while this exists. It is cleared by
/// [`UploadSession::complete`], [`UploadSession::abort`] or on drop.
#[derive(Debug)]
pub struct UploadSession {
    ledger: Arc<Ledger>,
    audit: AuditLog,
    paths: PathResolver,
    folder: String,
    root: PathBuf,
    archive_path: PathBuf,
    lock_timeout: Duration,
    released: bool,
}

impl UploadSession {
    pub(super) fn new(
        ledger: Arc<Ledger>,
        audit: AuditLog,
        paths: PathResolver,
        folder: String,
        root: PathBuf,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            audit,
            paths,
            folder,
            root,
            archive_path: PathBuf::new(),
            lock_timeout,
            released: false,
        }
    }

    pub(super) fn with_archive_path(mut self, archive_path: PathBuf) -> Self {
        self.archive_path = archive_path;
        self
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// File the request body must be persisted to
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Stream a request body to the archive file, enforcing `limit`.
    ///
    /// An oversized body is discarded and reported as `PayloadTooLarge`.
    pub async fn receive<B>(&self, mut body: B, limit: Option<u64>) -> ExchangeResult<u64>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let mut file = tokio::fs::File::create(&self.archive_path).await?;
        let mut written: u64 = 0;

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(io::Error::other)?;
            let Ok(data) = frame.into_data() else {
                continue;
            };
            written += data.len() as u64;
            if let Some(limit) = limit {
                if written > limit {
                    drop(file);
                    self.discard_archive();
                    return Err(ExchangeError::PayloadTooLarge { limit });
                }
            }
            file.write_all(&data).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Expand the persisted archive and close the bracket.
    ///
    /// The outcome is written to the audit log either way.
    pub fn complete(mut self, bytes: u64) -> ExchangeResult<UploadOutcome> {
        let result = self.expand();
        self.release();

        let name = self
            .archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match result {
            Ok(expanded) => {
                info!(
                    folder = %self.folder,
                    bytes,
                    entries = expanded.len(),
                    "postcache expanded"
                );
                self.audit.info(
                    &self.folder,
                    format!(
                        "postcache {} ({} bytes) expanded {} entries: {}",
                        name,
                        bytes,
                        expanded.len(),
                        expanded.join(", ")
                    ),
                );
                Ok(UploadOutcome {
                    bytes,
                    expanded,
                    archive_path: self.archive_path.clone(),
                })
            }
            Err(e) => {
                let detail = match &e {
                    ExchangeError::Extract(partial) => format!(
                        "{} (expanded before failure: [{}])",
                        partial.source,
                        partial.expanded.join(", ")
                    ),
                    other => other.to_string(),
                };
                warn!(folder = %self.folder, error = %detail, "postcache expansion failed");
                self.audit.error(
                    &self.folder,
                    format!("postcache {} ({} bytes) failed: {}", name, bytes, detail),
                );
                Err(e)
            }
        }
    }

    /// Give up on the upload, removing any partial archive.
    pub fn abort(mut self, reason: &str) {
        self.audit
            .error(&self.folder, format!("upload aborted: {}", reason));
        self.discard_archive();
        self.release();
    }

    fn expand(&self) -> ExchangeResult<Vec<String>> {
        let _lock = ChangesetLock::acquire(&self.paths, &self.folder, self.lock_timeout)?;
        Ok(Extractor::new(&self.root).extract(&self.archive_path)?)
    }

    fn discard_archive(&self) {
        if let Err(e) = fs::remove_file(&self.archive_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.archive_path.display(), error = %e, "could not remove partial upload");
            }
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.ledger.finish_upload(&self.folder) {
            warn!(folder = %self.folder, error = %e, "could not clear uploading flag");
            self.audit
                .error(&self.folder, format!("could not clear uploading flag: {}", e));
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(folder = %self.folder, "upload dropped before completion");

        // Keep the ledger write off async worker threads
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.released = true;
                let ledger = Arc::clone(&self.ledger);
                let audit = self.audit.clone();
                let folder = std::mem::take(&mut self.folder);
                handle.spawn_blocking(move || {
                    if let Err(e) = ledger.finish_upload(&folder) {
                        warn!(folder = %folder, error = %e, "could not clear uploading flag");
                        audit.error(&folder, format!("could not clear uploading flag: {}", e));
                    }
                });
            }
            Err(_) => self.release(),
        }
    }
}
