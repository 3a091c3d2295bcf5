//! Template id → mirror file path mapping.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::error::LedgerResult;
use crate::Ledger;

impl Ledger {
    /// Stored file path for a template id.
    pub fn template_path(&self, template_id: &str) -> LedgerResult<Option<String>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT filepath FROM mirrorstate WHERE templateid = ?1",
                params![template_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Insert or replace the path recorded for a template id.
    pub fn upsert_template(&self, template_id: &str, file_path: &str) -> LedgerResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO mirrorstate (templateid, filepath, updated) VALUES (?1, ?2, ?3)
             ON CONFLICT(templateid) DO UPDATE SET filepath = excluded.filepath,
                                                  updated = excluded.updated",
            params![template_id, file_path, Utc::now()],
        )?;
        Ok(())
    }

    /// Number of mapped templates.
    pub fn template_count(&self) -> LedgerResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM mirrorstate", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}
