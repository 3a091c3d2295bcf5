//! Precache archive construction
//!
//! Builds a deterministic zip archive of a changeset tree. Entries are
//! regular files only, deflated and stored at their `/`-separated path
//! relative to the changeset root, in sorted order with a fixed timestamp,
//! so identical trees produce identical archives. The reserved `downloads`
//! directory is never walked.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::paths::is_reserved;

/// Errors for archive construction
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Zip error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("Walk error: {0}")]
    WalkError(#[from] walkdir::Error),

    #[error("Path is not within changeset root: {0}")]
    PathNotInChangeset(PathBuf),

    #[error("Changeset root does not exist: {0}")]
    MissingRoot(PathBuf),
}

/// A finished precache archive
#[derive(Debug, Clone)]
pub struct PrecacheArchive {
    /// Location of the archive
    pub path: PathBuf,
    /// Entry names in archive order
    pub entries: Vec<String>,
    /// Compressed size in bytes
    pub size: u64,
    /// SHA-256 of the archive file
    pub sha256: String,
}

impl PrecacheArchive {
    /// File name of the archive
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Precache archive builder for one changeset tree
pub struct PrecacheBuilder {
    root: PathBuf,
}

impl PrecacheBuilder {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Collect regular files to archive, keyed by entry name
    fn collect_entries(&self) -> Result<BTreeMap<String, EntryInfo>, BundleError> {
        if !self.root.is_dir() {
            return Err(BundleError::MissingRoot(self.root.clone()));
        }

        let mut entries = BTreeMap::new();
        let root = &self.root;

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(root) {
                Ok(rel) => !is_reserved(rel),
                Err(_) => true,
            });

        for entry in walker {
            let entry = entry?;
            let path = entry.path();

            let rel_path = path
                .strip_prefix(root)
                .map_err(|_| BundleError::PathNotInChangeset(path.to_path_buf()))?;

            if rel_path.as_os_str().is_empty() || entry.file_type().is_dir() {
                continue;
            }

            // Directories are implied by file paths; links and devices are not archived
            if !entry.file_type().is_file() {
                debug!(path = %rel_path.display(), "skipping non-regular entry");
                continue;
            }

            let Some(name) = entry_name(rel_path) else {
                warn!(path = %rel_path.display(), "skipping file with a non-UTF-8 name");
                continue;
            };

            let metadata = entry.metadata()?;
            entries.insert(
                name,
                EntryInfo {
                    path: path.to_path_buf(),
                    size: metadata.len(),
                    executable: is_executable(&metadata),
                },
            );
        }

        Ok(entries)
    }

    /// Build the archive at `output`.
    ///
    /// The archive is written to a temporary sibling and renamed into place,
    /// so `output` either holds a complete archive or does not exist.
    pub fn build(&self, output: &Path) -> Result<PrecacheArchive, BundleError> {
        let entries = self.collect_entries()?;

        let temp_path = temp_path_for(output);
        let written = self
            .write_archive(&entries, &temp_path)
            .and_then(|()| fs::rename(&temp_path, output).map_err(BundleError::from));
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        let (size, sha256) = digest_file(output)?;
        let entries = entries.into_keys().collect::<Vec<_>>();

        debug!(
            archive = %output.display(),
            entries = entries.len(),
            size,
            "precache archive written"
        );

        Ok(PrecacheArchive {
            path: output.to_path_buf(),
            entries,
            size,
            sha256,
        })
    }

    fn write_archive(
        &self,
        entries: &BTreeMap<String, EntryInfo>,
        temp_path: &Path,
    ) -> Result<(), BundleError> {
        let file = File::create(temp_path)?;
        let mut zip = ZipWriter::new(BufWriter::new(file));

        // BTreeMap iteration keeps entries sorted
        for (name, info) in entries {
            let options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .last_modified_time(DateTime::default())
                .unix_permissions(if info.executable { 0o755 } else { 0o644 })
                .large_file(info.size >= u64::from(u32::MAX));

            zip.start_file(name.as_str(), options)?;
            let mut source = File::open(&info.path)?;
            io::copy(&mut source, &mut zip)?;
        }

        let mut writer = zip.finish()?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;
        Ok(())
    }
}

/// Information about a collected entry
struct EntryInfo {
    path: PathBuf,
    size: u64,
    executable: bool,
}

/// Archive entry name: relative path with `/` separators.
///
/// `None` when a component is not valid UTF-8.
fn entry_name(rel_path: &Path) -> Option<String> {
    let parts = rel_path
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

fn temp_path_for(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!(".{}.partial", name))
}

fn digest_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((size, hex::encode(hasher.finalize())))
}

/// Check if a file is executable
fn is_executable(metadata: &fs::Metadata) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        false
    }
}
