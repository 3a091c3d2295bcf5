//! Changeset path resolution
//!
//! Maps folder keys to changeset trees under the configured changeset root
//! and confines every relative path handled by the service to its tree.
//! The reserved `downloads` subdirectory holds in-flight archives and the
//! changeset lock; it is never archived.

use chrono::Utc;
use dcc_protocol::RESERVED_DIR;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Errors from path resolution
#[derive(Debug, Error)]
pub enum PathError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PathError {
    fn invalid(path: impl AsRef<Path>, reason: &'static str) -> Self {
        Self::InvalidPath {
            path: path.as_ref().to_string_lossy().into_owned(),
            reason,
        }
    }
}

/// Role of a transient archive under `downloads/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveRole {
    /// Server-built snapshot sent to a client
    Precache,
    /// Client edits received from a client
    Postcache,
}

impl ArchiveRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveRole::Precache => "precache",
            ArchiveRole::Postcache => "postcache",
        }
    }
}

/// Container file extension.
pub const ARCHIVE_EXTENSION: &str = "zip";

/// `<unixMillis>-<role>.zip`
pub fn archive_file_name(role: ArchiveRole, millis: i64) -> String {
    format!("{}-{}.{}", millis, role.as_str(), ARCHIVE_EXTENSION)
}

/// Whether any segment of a relative path is the reserved directory.
pub fn is_reserved(relative: &Path) -> bool {
    relative
        .components()
        .any(|c| matches!(c, Component::Normal(name) if name == RESERVED_DIR))
}

/// Check that a client-supplied folder key names exactly one directory.
pub fn validate_folder_key(key: &str) -> Result<(), PathError> {
    if key.trim().is_empty() {
        return Err(PathError::invalid(key, "empty folder key"));
    }
    if key.contains('/') || key.contains('\\') || key.contains('\0') {
        return Err(PathError::invalid(key, "folder key contains a separator"));
    }
    if key == "." || key == ".." {
        return Err(PathError::invalid(key, "folder key is a relative reference"));
    }
    if key == RESERVED_DIR {
        return Err(PathError::invalid(key, "folder key is reserved"));
    }
    Ok(())
}

/// Resolve `relative` under `root`, refusing anything that would land
/// outside it.
///
/// Rejects absolute paths, root and prefix components, `..` segments and
/// empty paths. Existing components that are symlinks must resolve inside
/// the canonical root.
pub fn resolve_within(root: &Path, relative: &Path) -> Result<PathBuf, PathError> {
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(PathError::invalid(relative, "parent directory reference"))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::invalid(relative, "absolute path"))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(PathError::invalid(relative, "path does not name an entry"));
    }

    let resolved = root.join(&clean);
    check_symlinked_ancestors(root, &clean)?;
    Ok(resolved)
}

fn check_symlinked_ancestors(root: &Path, clean: &Path) -> Result<(), PathError> {
    let canonical_root = match root.canonicalize() {
        Ok(path) => path,
        // Nothing under a missing root can be a symlink yet.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PathError::Io(e)),
    };

    let mut current = root.to_path_buf();
    for component in clean.components() {
        current.push(component);
        let metadata = match fs::symlink_metadata(&current) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(PathError::Io(e)),
        };
        if metadata.file_type().is_symlink() {
            let target = current
                .canonicalize()
                .map_err(|_| PathError::invalid(clean, "dangling symlink"))?;
            if !target.starts_with(&canonical_root) {
                return Err(PathError::invalid(clean, "symlink escapes changeset root"));
            }
        }
    }
    Ok(())
}

/// Resolves changeset folders under the configured changeset root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding every changeset tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk root of a changeset.
    pub fn changeset_root(&self, folder: &str) -> Result<PathBuf, PathError> {
        validate_folder_key(folder)?;
        Ok(self.root.join(folder))
    }

    /// The changeset's reserved directory.
    pub fn downloads_dir(&self, folder: &str) -> Result<PathBuf, PathError> {
        Ok(self.changeset_root(folder)?.join(RESERVED_DIR))
    }

    /// Create a changeset tree and its reserved directory.
    pub fn create_changeset(&self, folder: &str) -> Result<PathBuf, PathError> {
        let root = self.changeset_root(folder)?;
        fs::create_dir_all(root.join(RESERVED_DIR))?;
        Ok(root)
    }

    /// A fresh, unused archive path in the changeset's reserved directory.
    ///
    /// The reserved directory is created if missing.
    pub fn new_archive_path(&self, folder: &str, role: ArchiveRole) -> Result<PathBuf, PathError> {
        let downloads = self.downloads_dir(folder)?;
        fs::create_dir_all(&downloads)?;
        let mut millis = Utc::now().timestamp_millis();
        loop {
            let candidate = downloads.join(archive_file_name(role, millis));
            if !candidate.exists() {
                return Ok(candidate);
            }
            millis += 1;
        }
    }
}
