//! Postcache archive expansion
//!
//! Expands an untrusted zip archive into a changeset tree. Every entry is
//! checked before anything is written: names must stay inside the target,
//! links and device entries are refused and each body is read through so a
//! bad checksum or truncated stream fails up front. Only then are
//! directories and files written. Entries overwrite existing files
//! unconditionally, and entries under the reserved `downloads` directory
//! are dropped.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::paths::{is_reserved, resolve_within, PathError};

/// Errors from archive expansion
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("entry escapes target directory: {0}")]
    PathTraversal(String),

    #[error("unsupported {kind} entry: {path}")]
    UnsupportedEntry { path: String, kind: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ZipError> for ExtractError {
    fn from(e: ZipError) -> Self {
        ExtractError::CorruptArchive(e.to_string())
    }
}

/// Expansion stopped part-way; entries listed in `expanded` were written.
#[derive(Debug, Error)]
#[error("extraction stopped after {} entries: {source}", .expanded.len())]
pub struct PartialExtract {
    pub expanded: Vec<String>,
    #[source]
    pub source: ExtractError,
}

impl From<ExtractError> for PartialExtract {
    fn from(source: ExtractError) -> Self {
        Self {
            expanded: Vec::new(),
            source,
        }
    }
}

/// What the entry at the same index expands to
#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryPlan {
    Directory(String),
    File { name: String, executable: bool },
    Skip,
}

type Archive = ZipArchive<BufReader<File>>;

/// Expands postcache archives into a target directory
#[derive(Debug, Clone)]
pub struct Extractor {
    target: PathBuf,
}

impl Extractor {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Expand `archive` into the target directory.
    ///
    /// Returns the names of every expanded entry in archive order. On
    /// failure nothing is rolled back; the error carries the entries
    /// expanded before the failing one. Validation failures leave the
    /// target untouched.
    pub fn extract(&self, archive: &Path) -> Result<Vec<String>, PartialExtract> {
        fs::create_dir_all(&self.target).map_err(ExtractError::from)?;
        let target = self.target.canonicalize().map_err(ExtractError::from)?;

        let mut zip = open(archive)?;
        let plan = validate(&mut zip, &target)?;

        let mut expanded = Vec::with_capacity(plan.len());
        match expand(&mut zip, &target, &plan, &mut expanded) {
            Ok(()) => Ok(expanded),
            Err(source) => Err(PartialExtract { expanded, source }),
        }
    }
}

fn open(archive: &Path) -> Result<Archive, ExtractError> {
    let file = File::open(archive)?;
    if file.metadata()?.len() == 0 {
        return Err(ExtractError::CorruptArchive("archive is empty".to_string()));
    }
    Ok(ZipArchive::new(BufReader::new(file))?)
}

/// Check every entry without writing anything.
fn validate(zip: &mut Archive, target: &Path) -> Result<Vec<EntryPlan>, ExtractError> {
    let mut plan = Vec::with_capacity(zip.len());

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let name = entry_name(entry.name());

        if let Some(kind) = entry.unix_mode().and_then(special_kind) {
            return Err(ExtractError::UnsupportedEntry { path: name, kind });
        }

        let step = if entry.is_dir() {
            if names_root(&name) {
                EntryPlan::Skip
            } else {
                check_name(target, &name)?;
                if is_reserved(Path::new(&name)) {
                    EntryPlan::Skip
                } else {
                    EntryPlan::Directory(name)
                }
            }
        } else {
            check_name(target, &name)?;
            let executable = entry.unix_mode().map(|m| m & 0o111 != 0).unwrap_or(false);
            if is_reserved(Path::new(&name)) {
                EntryPlan::Skip
            } else {
                EntryPlan::File { name, executable }
            }
        };

        // Reading to the end verifies the stored checksum
        io::copy(&mut entry, &mut io::sink()).map_err(corrupt)?;
        plan.push(step);
    }

    Ok(plan)
}

fn expand(
    zip: &mut Archive,
    target: &Path,
    plan: &[EntryPlan],
    expanded: &mut Vec<String>,
) -> Result<(), ExtractError> {
    for (index, step) in plan.iter().enumerate() {
        match step {
            EntryPlan::Skip => continue,
            EntryPlan::Directory(name) => {
                let dest = destination(target, name)?;
                fs::create_dir_all(&dest)?;
                expanded.push(name.clone());
            }
            EntryPlan::File { name, executable } => {
                let dest = destination(target, name)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                    let parent = parent.canonicalize()?;
                    if !parent.starts_with(target) {
                        return Err(ExtractError::PathTraversal(name.clone()));
                    }
                }
                let mut entry = zip.by_index(index)?;
                let mut out = File::create(&dest)?;
                io::copy(&mut entry, &mut out).map_err(corrupt)?;
                set_executable(&dest, *executable)?;
                expanded.push(name.clone());
            }
        }
    }

    debug!(target = %target.display(), entries = expanded.len(), "archive expanded");
    Ok(())
}

fn check_name(target: &Path, name: &str) -> Result<(), ExtractError> {
    destination(target, name).map(|_| ())
}

/// Re-resolved at write time, since earlier entries may have changed the tree
fn destination(target: &Path, name: &str) -> Result<PathBuf, ExtractError> {
    resolve_within(target, Path::new(name)).map_err(|e| match e {
        PathError::InvalidPath { .. } => ExtractError::PathTraversal(name.to_string()),
        PathError::Io(io) => ExtractError::Io(io),
    })
}

/// Entry name with `/` separators and no trailing slash.
///
/// Windows clients write `\`; it is treated as a separator so `..\x`
/// cannot slip past the traversal check.
fn entry_name(raw: &str) -> String {
    raw.replace('\\', "/").trim_end_matches('/').to_string()
}

/// `./` style entries that name the target itself
fn names_root(name: &str) -> bool {
    Path::new(name)
        .components()
        .all(|c| matches!(c, Component::CurDir))
}

/// File-type bits of a unix mode that are neither regular file nor directory
fn special_kind(mode: u32) -> Option<&'static str> {
    match mode & 0o170000 {
        0 | 0o100000 | 0o040000 => None,
        0o120000 => Some("symlink"),
        0o020000 => Some("character device"),
        0o060000 => Some("block device"),
        0o010000 => Some("fifo"),
        0o140000 => Some("socket"),
        _ => Some("special"),
    }
}

fn corrupt(e: io::Error) -> ExtractError {
    ExtractError::CorruptArchive(e.to_string())
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if executable {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    enum Item<'a> {
        File(&'a str, &'a [u8]),
        Stored(&'a str, &'a [u8]),
        Dir(&'a str),
        Symlink(&'a str, &'a str),
    }

    fn write_archive(path: &Path, items: &[Item<'_>]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for item in items {
            match item {
                Item::File(name, body) => {
                    zip.start_file(*name, deflated).unwrap();
                    zip.write_all(body).unwrap();
                }
                Item::Stored(name, body) => {
                    zip.start_file(*name, stored).unwrap();
                    zip.write_all(body).unwrap();
                }
                Item::Dir(name) => zip.add_directory(*name, deflated).unwrap(),
                Item::Symlink(name, target) => zip.add_symlink(*name, *target, deflated).unwrap(),
            }
        }
        zip.finish().unwrap();
    }

    fn is_empty_dir(path: &Path) -> bool {
        fs::read_dir(path).unwrap().next().is_none()
    }

    #[test]
    fn test_extract_files_and_dirs() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        write_archive(
            &archive,
            &[
                Item::Dir("sub/"),
                Item::File("sub/b.oet", b"b"),
                Item::File("a.xml", b"a"),
            ],
        );
        let target = TempDir::new().unwrap();

        let expanded = Extractor::new(target.path()).extract(&archive).unwrap();

        assert_eq!(expanded, vec!["sub", "sub/b.oet", "a.xml"]);
        assert_eq!(fs::read(target.path().join("sub/b.oet")).unwrap(), b"b");
        assert_eq!(fs::read(target.path().join("a.xml")).unwrap(), b"a");
    }

    #[test]
    fn test_files_without_directory_entries() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        write_archive(&archive, &[Item::File("deep/er/c.txt", b"c")]);
        let target = TempDir::new().unwrap();

        Extractor::new(target.path()).extract(&archive).unwrap();

        assert_eq!(fs::read(target.path().join("deep/er/c.txt")).unwrap(), b"c");
    }

    #[test]
    fn test_overwrites_existing_files() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        write_archive(&archive, &[Item::File("a.xml", b"new")]);
        let target = TempDir::new().unwrap();
        fs::write(target.path().join("a.xml"), "old contents").unwrap();

        Extractor::new(target.path()).extract(&archive).unwrap();

        assert_eq!(fs::read(target.path().join("a.xml")).unwrap(), b"new");
    }

    #[test]
    fn test_parent_traversal_writes_nothing() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        write_archive(
            &archive,
            &[Item::File("ok.txt", b"fine"), Item::File("../evil.txt", b"bad")],
        );
        let target = work.path().join("target");
        fs::create_dir(&target).unwrap();

        let err = Extractor::new(&target).extract(&archive).unwrap_err();

        assert!(matches!(err.source, ExtractError::PathTraversal(_)));
        assert!(err.expanded.is_empty());
        assert!(is_empty_dir(&target));
        assert!(!work.path().join("evil.txt").exists());
    }

    #[test]
    fn test_backslash_traversal_rejected() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        write_archive(&archive, &[Item::File("..\\evil.txt", b"bad")]);
        let target = work.path().join("target");
        fs::create_dir(&target).unwrap();

        let err = Extractor::new(&target).extract(&archive).unwrap_err();

        assert!(matches!(err.source, ExtractError::PathTraversal(_)));
        assert!(is_empty_dir(&target));
    }

    #[test]
    fn test_absolute_entry_rejected() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        write_archive(&archive, &[Item::File("/tmp/dcc-abs.txt", b"bad")]);
        let target = TempDir::new().unwrap();

        let err = Extractor::new(target.path()).extract(&archive).unwrap_err();

        assert!(matches!(err.source, ExtractError::PathTraversal(_)));
        assert!(is_empty_dir(target.path()));
    }

    #[test]
    fn test_symlink_entry_rejected() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        write_archive(
            &archive,
            &[Item::File("a.xml", b"a"), Item::Symlink("link", "elsewhere")],
        );
        let target = TempDir::new().unwrap();

        let err = Extractor::new(target.path()).extract(&archive).unwrap_err();

        assert!(matches!(
            err.source,
            ExtractError::UnsupportedEntry { kind: "symlink", .. }
        ));
        assert!(is_empty_dir(target.path()));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();
        let target = TempDir::new().unwrap();

        let err = Extractor::new(target.path()).extract(&archive).unwrap_err();
        assert!(matches!(err.source, ExtractError::CorruptArchive(_)));
    }

    #[test]
    fn test_empty_file_is_corrupt() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        fs::write(&archive, b"").unwrap();
        let target = TempDir::new().unwrap();

        let err = Extractor::new(target.path()).extract(&archive).unwrap_err();
        assert!(matches!(err.source, ExtractError::CorruptArchive(_)));
    }

    #[test]
    fn test_empty_zip_expands_nothing() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        write_archive(&archive, &[]);
        let target = TempDir::new().unwrap();

        let expanded = Extractor::new(target.path()).extract(&archive).unwrap();
        assert!(expanded.is_empty());
    }

    #[test]
    fn test_truncated_archive_writes_nothing() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        write_archive(&archive, &[Item::File("a.bin", b"a"), Item::File("b.bin", &[7u8; 4096])]);
        let bytes = fs::read(&archive).unwrap();
        fs::write(&archive, &bytes[..bytes.len() / 2]).unwrap();
        let target = TempDir::new().unwrap();

        let err = Extractor::new(target.path()).extract(&archive).unwrap_err();

        assert!(matches!(err.source, ExtractError::CorruptArchive(_)));
        assert!(is_empty_dir(target.path()));
    }

    #[test]
    fn test_bad_checksum_writes_nothing() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        write_archive(
            &archive,
            &[Item::Stored("a.bin", b"a"), Item::Stored("z.bin", &[b'Z'; 256])],
        );
        let mut bytes = fs::read(&archive).unwrap();
        let body = bytes.windows(256).position(|w| w.iter().all(|b| *b == b'Z')).unwrap();
        bytes[body + 100] = b'Y';
        fs::write(&archive, &bytes).unwrap();
        let target = TempDir::new().unwrap();

        let err = Extractor::new(target.path()).extract(&archive).unwrap_err();

        assert!(matches!(err.source, ExtractError::CorruptArchive(_)));
        assert!(is_empty_dir(target.path()));
    }

    #[test]
    fn test_reserved_entries_skipped() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        write_archive(
            &archive,
            &[
                Item::Dir("downloads/"),
                Item::File("downloads/.dcc.lock", b"x"),
                Item::File("a.xml", b"a"),
            ],
        );
        let target = TempDir::new().unwrap();

        let expanded = Extractor::new(target.path()).extract(&archive).unwrap();

        assert_eq!(expanded, vec!["a.xml"]);
        assert!(!target.path().join("downloads").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_through_escaping_symlink_rejected() {
        use std::os::unix::fs::symlink;

        let work = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        write_archive(&archive, &[Item::File("link/owned.txt", b"bad")]);
        let target = TempDir::new().unwrap();
        symlink(outside.path(), target.path().join("link")).unwrap();

        let err = Extractor::new(target.path()).extract(&archive).unwrap_err();

        assert!(matches!(err.source, ExtractError::PathTraversal(_)));
        assert!(!outside.path().join("owned.txt").exists());
    }

    #[test]
    fn test_long_and_non_ascii_names() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("in.zip");
        let long = format!("{}final.oet", "nested-directory-level/".repeat(8));
        assert!(long.len() > 100);
        write_archive(
            &archive,
            &[Item::File(&long, b"long"), Item::File("Übersicht/血压.xml", b"cjk")],
        );
        let target = TempDir::new().unwrap();

        let expanded = Extractor::new(target.path()).extract(&archive).unwrap();

        assert_eq!(expanded, vec![long.as_str(), "Übersicht/血压.xml"]);
        assert_eq!(fs::read(target.path().join(&long)).unwrap(), b"long");
        assert_eq!(
            fs::read(target.path().join("Übersicht/血压.xml")).unwrap(),
            b"cjk"
        );
    }

    #[test]
    fn test_special_kind_from_mode() {
        assert_eq!(special_kind(0o100644), None);
        assert_eq!(special_kind(0o040755), None);
        assert_eq!(special_kind(0o644), None);
        assert_eq!(special_kind(0o120777), Some("symlink"));
        assert_eq!(special_kind(0o020600), Some("character device"));
    }
}
