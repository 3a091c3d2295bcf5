//! Changeset tree search
//!
//! File-name search with glob patterns and content search with regular
//! expressions. The reserved `downloads` directory is never searched.

mod mirror;

pub use mirror::{index_mirror, MirrorError, MirrorReport};

use globset::{Glob, GlobMatcher};
use regex_lite::Regex;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::paths::is_reserved;

/// Errors from tree search
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),

    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex_lite::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A content match
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrepMatch {
    /// Path relative to the searched root
    pub path: String,
    /// 1-based line number
    pub line: usize,
    pub text: String,
}

/// Marker preceding a template identifier in template files
const TEMPLATE_ID_MARKER: &str = "<id>";

/// Template identifiers are UUID strings
const TEMPLATE_ID_LEN: usize = 36;

/// Regular files under `root`, skipping the reserved directory, sorted.
fn walk_files(root: &Path) -> impl Iterator<Item = Result<(PathBuf, PathBuf), SearchError>> + '_ {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_entry(move |entry| {
            entry
                .path()
                .strip_prefix(root)
                .map(|rel| !is_reserved(rel))
                .unwrap_or(true)
        })
        .filter_map(move |entry| match entry {
            Ok(entry) if entry.file_type().is_file() => {
                let rel = entry
                    .path()
                    .strip_prefix(root)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|_| entry.path().to_path_buf());
                Some(Ok((entry.path().to_path_buf(), rel)))
            }
            Ok(_) => None,
            Err(e) => Some(Err(SearchError::from(e))),
        })
}

fn display_rel(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}

/// Files whose name matches `pattern`.
///
/// A pattern without `/` is matched against the file name, otherwise
/// against the relative path.
pub fn find_by_name(root: &Path, pattern: &str) -> Result<Vec<String>, SearchError> {
    let matcher: GlobMatcher = Glob::new(pattern)?.compile_matcher();
    let match_path = pattern.contains('/');

    let mut found = Vec::new();
    for item in walk_files(root) {
        let (full, rel) = item?;
        let candidate = if match_path {
            display_rel(&rel)
        } else {
            full.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        if matcher.is_match(candidate.as_str()) {
            found.push(display_rel(&rel));
        }
    }
    Ok(found)
}

/// Lines matching `pattern` in every text file under `root`.
///
/// Files that are not valid UTF-8 are skipped.
pub fn grep_tree(root: &Path, pattern: &str) -> Result<Vec<GrepMatch>, SearchError> {
    let regex = Regex::new(pattern)?;

    let mut matches = Vec::new();
    for item in walk_files(root) {
        let (full, rel) = item?;
        let content = match fs::read_to_string(&full) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => continue,
            Err(e) => return Err(e.into()),
        };
        for (index, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(GrepMatch {
                    path: display_rel(&rel),
                    line: index + 1,
                    text: line.to_string(),
                });
            }
        }
    }
    Ok(matches)
}

/// Template identifier embedded in template content.
///
/// The content is lowercased and the identifier is the 36 characters
/// following the first `<id>` marker. Returns `None` when there is no
/// marker or too few characters follow it.
pub fn template_id(content: &str) -> Option<String> {
    let lowered = content.to_lowercase();
    let (_, rest) = lowered.split_once(TEMPLATE_ID_MARKER)?;
    let id: String = rest.chars().take(TEMPLATE_ID_LEN).collect();
    (id.chars().count() == TEMPLATE_ID_LEN).then_some(id)
}

/// Template identifier of a file, read as lossy UTF-8.
pub fn template_id_of_file(path: &Path) -> Result<Option<String>, SearchError> {
    let bytes = fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes);
    // Line breaks are joined with spaces before the marker search
    let joined = content.lines().collect::<Vec<_>>().join(" ");
    Ok(template_id(&joined))
}
