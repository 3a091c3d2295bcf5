//! Work-in-progress assets checked out by client editors.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use crate::error::LedgerResult;
use crate::Ledger;

/// A checked-out asset, keyed by (folder, template id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WipAsset {
    pub folder: String,
    pub template_id: String,
    /// Absolute path of the backing file inside the changeset tree
    pub full_file_path: String,
    /// Display filename (the template name)
    pub filename: String,
    /// Content hash at check-out; not computed at present
    pub initial_hash: Option<String>,
    pub initial_version: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub important: bool,
    pub latest: bool,
    pub modified: bool,
}

impl WipAsset {
    /// A fresh check-out row.
    pub fn checkout(
        folder: impl Into<String>,
        template_id: impl Into<String>,
        full_file_path: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            folder: folder.into(),
            template_id: template_id.into(),
            full_file_path: full_file_path.into(),
            filename: filename.into(),
            initial_hash: None,
            initial_version: 0,
            created: now,
            updated: now,
            important: true,
            latest: true,
            modified: false,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            folder: row.get("folder")?,
            template_id: row.get("resourcemainid")?,
            full_file_path: row.get("fullfilepath")?,
            filename: row.get("filename")?,
            initial_hash: row.get("initialmd5")?,
            initial_version: row.get("initialversion")?,
            created: row.get("created")?,
            updated: row.get("updated")?,
            important: row.get("importanttouser")?,
            latest: row.get("islatest")?,
            modified: row.get("modified")?,
        })
    }
}

const WIP_COLUMNS: &str = "folder, resourcemainid, fullfilepath, filename, initialmd5, \
    initialversion, created, updated, importanttouser, islatest, modified";

impl Ledger {
    /// Record a checked-out asset.
    ///
    /// A second check-out of the same (folder, template id) violates the
    /// table's key and fails.
    pub fn record_wip(&self, asset: &WipAsset) -> LedgerResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO damasset
             (folder, resourcemainid, fullfilepath, filename, initialmd5, initialversion,
              created, updated, importanttouser, islatest, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                asset.folder,
                asset.template_id,
                asset.full_file_path,
                asset.filename,
                asset.initial_hash,
                asset.initial_version,
                asset.created,
                asset.updated,
                asset.important,
                asset.latest,
                asset.modified
            ],
        )?;
        Ok(())
    }

    /// Look up a checked-out asset.
    pub fn wip(&self, folder: &str, template_id: &str) -> LedgerResult<Option<WipAsset>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM damasset WHERE folder = ?1 AND resourcemainid = ?2",
            WIP_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![folder, template_id], WipAsset::from_row)
            .optional()?)
    }

    /// Backing file path of a checked-out asset.
    pub fn wip_path(&self, folder: &str, template_id: &str) -> LedgerResult<Option<String>> {
        Ok(self.wip(folder, template_id)?.map(|asset| asset.full_file_path))
    }

    /// All assets checked out in a folder, ordered by template id.
    pub fn wip_assets(&self, folder: &str) -> LedgerResult<Vec<WipAsset>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM damasset WHERE folder = ?1 ORDER BY resourcemainid",
            WIP_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![folder], WipAsset::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete a checked-out asset row, returning it if it existed.
    ///
    /// Deleting a missing row is not an error.
    pub fn remove_wip(&self, folder: &str, template_id: &str) -> LedgerResult<Option<WipAsset>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql = format!(
            "SELECT {} FROM damasset WHERE folder = ?1 AND resourcemainid = ?2",
            WIP_COLUMNS
        );
        let existing = tx
            .query_row(&sql, params![folder, template_id], WipAsset::from_row)
            .optional()?;
        tx.execute(
            "DELETE FROM damasset WHERE folder = ?1 AND resourcemainid = ?2",
            params![folder, template_id],
        )?;
        tx.commit()?;
        Ok(existing)
    }
}
