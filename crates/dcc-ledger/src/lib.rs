//! Changeset Status Ledger
//!
//! Persistent record of changeset lifecycle flags, the pool of changeset
//! folders, checked-out WIP assets, template mappings and audit log entries.
//!
//! The store is a single SQLite connection guarded by a mutex. Every mutating
//! operation that touches more than one row runs inside an immediate
//! transaction so conflicting updates for one folder are serialized.

mod changeset;
mod error;
mod log;
mod schema;
mod state;
mod templates;
mod wip;

pub use changeset::{Changeset, LinkRequest};
pub use error::{LedgerError, LedgerResult};
pub use log::{LogEntry, LogLevel};
pub use state::ChangesetState;
pub use wip::WipAsset;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Handle to the ledger store.
#[derive(Debug)]
pub struct Ledger {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Ledger {
    /// Open (or create) the ledger database at `path` and apply the schema.
    ///
    /// Any failure here is reported as `StorageUnavailable`.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LedgerError::StorageUnavailable(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let conn = Connection::open(&path).map_err(|e| {
            LedgerError::StorageUnavailable(format!("cannot open {}: {}", path.display(), e))
        })?;
        let ledger = Self::from_connection(conn, Some(path))?;
        debug!(path = ?ledger.path, "ledger opened");
        Ok(ledger)
    }

    /// Open a private in-memory ledger.
    pub fn open_in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
        Self::from_connection(conn, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> LedgerResult<Self> {
        schema::migrate(&conn)
            .map_err(|e| LedgerError::StorageUnavailable(format!("schema migration failed: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Database file, or `None` for in-memory ledgers.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Check that the store still answers.
    pub fn ping(&self) -> LedgerResult<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::StorageUnavailable("ledger connection poisoned".to_string()))
    }
}
