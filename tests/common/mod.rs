//! Shared helpers for integration tests
//!
//! Builds a cache service over a temporary changeset root with an
//! in-memory ledger, and writes archives the way clients do.

#![allow(dead_code)]

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dam_client_cache::config::ServerConfig;
use dam_client_cache::exchange::{ExchangeContext, ExchangeError, UploadSession};
use dcc_ledger::Ledger;
use dcc_protocol::LinkTicketForm;
use http_body_util::Full;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// A cache service rooted in a temporary directory
pub struct TestService {
    pub dir: TempDir,
    pub ctx: Arc<ExchangeContext>,
}

impl TestService {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            changeset_path: dir.path().join("changesets"),
            support_archive_path: dir.path().join("transform-support.zip"),
            lock_timeout_secs: 1,
            ..ServerConfig::default()
        };
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let ctx = Arc::new(ExchangeContext::new(config, ledger));
        Self { dir, ctx }
    }

    /// Register a folder and link a ticket to it.
    pub fn linked(folder: &str, ticket: &str) -> Self {
        let service = Self::new();
        service.ctx.register_folder(folder).unwrap();
        let linked = service.ctx.link_ticket(&link_form(ticket)).unwrap();
        assert_eq!(linked, folder);
        service
    }

    pub fn root(&self, folder: &str) -> PathBuf {
        self.dir.path().join("changesets").join(folder)
    }

    /// Write a file under a changeset tree, creating parents.
    pub fn write(&self, folder: &str, relative: &str, content: &[u8]) {
        let path = self.root(folder).join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

pub fn link_form(ticket: &str) -> LinkTicketForm {
    LinkTicketForm {
        ticket: ticket.to_string(),
        description: format!("{} description", ticket),
        lead: "lead".to_string(),
        assignee: "assignee".to_string(),
    }
}

/// Zip archive with entry names written as given, so traversal names
/// can be sent.
pub fn raw_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(body).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// Stream `body` into an upload session from synchronous test code.
pub fn receive(
    session: &UploadSession,
    body: &[u8],
    limit: Option<u64>,
) -> Result<u64, ExchangeError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(session.receive(Full::new(Bytes::copy_from_slice(body)), limit))
}

/// Relative paths of regular files under `root`, sorted, `/`-separated.
pub fn tree_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}
