//! Per-changeset exclusive lock
//!
//! An advisory lock on `<changeset>/downloads/.dcc.lock`, keyed by folder
//! and held for the whole of a precache build or postcache expansion. A
//! build and an expansion of the same folder never overlap; different
//! folders never contend.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::paths::{PathError, PathResolver};

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("changeset {folder} still locked after {waited:?}")]
    Timeout { folder: String, waited: Duration },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Exclusive lock on one changeset tree, released on drop.
#[derive(Debug)]
pub struct ChangesetLock {
    folder: String,
    lock_path: PathBuf,
    file: File,
}

impl ChangesetLock {
    /// Lock file name inside the reserved directory
    pub const LOCK_FILENAME: &'static str = ".dcc.lock";

    const MIN_BACKOFF: Duration = Duration::from_millis(10);
    const MAX_BACKOFF: Duration = Duration::from_millis(200);
    const CONTENTION_WARNING: Duration = Duration::from_millis(500);

    /// Lock `folder`, waiting up to `timeout` for another holder to let go.
    ///
    /// The reserved directory and lock file are created when missing.
    pub fn acquire(paths: &PathResolver, folder: &str, timeout: Duration) -> LockResult<Self> {
        let downloads = paths.downloads_dir(folder)?;
        fs::create_dir_all(&downloads)?;
        let lock_path = downloads.join(Self::LOCK_FILENAME);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        let mut backoff = Self::MIN_BACKOFF;
        let mut warned = false;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    if warned {
                        debug!(
                            folder,
                            waited_ms = start.elapsed().as_millis() as u64,
                            "changeset lock acquired after contention"
                        );
                    }
                    return Ok(Self {
                        folder: folder.to_string(),
                        lock_path,
                        file,
                    });
                }
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(LockError::Io(e)),
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    folder: folder.to_string(),
                    waited,
                });
            }
            if !warned && waited > Self::CONTENTION_WARNING {
                warn!(folder, "changeset lock contention, waiting");
                warned = true;
            }

            std::thread::sleep(backoff.min(timeout - waited));
            backoff = (backoff * 2).min(Self::MAX_BACKOFF);
        }
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for ChangesetLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(folder = %self.folder, error = %e, "failed to release changeset lock");
        }
    }
}
