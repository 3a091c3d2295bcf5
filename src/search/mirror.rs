//! Mirror indexing
//!
//! Scans a template mirror and records each template's identifier and file
//! path in the ledger's template table.

use dcc_ledger::{Ledger, LedgerError};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{template_id_of_file, SearchError};

/// File extensions scanned for template identifiers
const TEMPLATE_EXTENSIONS: &[&str] = &["oet", "xml"];

/// Errors that abort a mirror scan
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Outcome of a mirror scan
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorReport {
    /// Candidate files read
    pub scanned: usize,
    /// Files whose identifier was recorded
    pub mapped: usize,
    /// Candidate files without an identifier
    pub skipped: usize,
}

fn is_candidate(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| TEMPLATE_EXTENSIONS.iter().any(|t| e.eq_ignore_ascii_case(t)))
        .unwrap_or(false)
}

/// Record the identifier of every template file under `mirror_root`.
///
/// Later files win when two share an identifier.
pub fn index_mirror(ledger: &Ledger, mirror_root: &Path) -> Result<MirrorReport, MirrorError> {
    let mut report = MirrorReport::default();

    for entry in WalkDir::new(mirror_root)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry.map_err(SearchError::from)?;
        if !entry.file_type().is_file() || !is_candidate(entry.path()) {
            continue;
        }

        report.scanned += 1;
        match template_id_of_file(entry.path())? {
            Some(id) => {
                let path = entry.path().to_string_lossy();
                ledger.upsert_template(&id, &path)?;
                debug!(template_id = %id, path = %path, "template mapped");
                report.mapped += 1;
            }
            None => report.skipped += 1,
        }
    }

    info!(
        root = %mirror_root.display(),
        scanned = report.scanned,
        mapped = report.mapped,
        skipped = report.skipped,
        "mirror indexed"
    );
    Ok(report)
}
