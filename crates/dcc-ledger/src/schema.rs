//! Ledger schema.
//!
//! Table and column names are kept compatible with the ledger used by the
//! downstream ingestion jobs (`change`, `damfolder`, `damasset`,
//! `mirrorstate`, `log`).

use rusqlite::Connection;

/// Current schema version recorded in `user_version`.
pub const SCHEMA_VERSION: i64 = 1;

pub(crate) fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;

        CREATE TABLE IF NOT EXISTS damfolder (
          folder TEXT PRIMARY KEY,
          jirakey TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS damfolder_jirakey ON damfolder (jirakey);

        CREATE TABLE IF NOT EXISTS "change" (
          jirakey TEXT PRIMARY KEY,
          folder TEXT NOT NULL UNIQUE,
          description TEXT NOT NULL DEFAULT '',
          "lead" TEXT NOT NULL DEFAULT '',
          jiraassignee TEXT NOT NULL DEFAULT '',
          targetstartdate TEXT,
          targetrepositoryenddate TEXT,
          targetenddate TEXT,
          percentagecomplete TEXT NOT NULL DEFAULT '',
          active INTEGER NOT NULL DEFAULT 0,
          implementationnotes TEXT NOT NULL DEFAULT '',
          state_ready INTEGER NOT NULL DEFAULT 0,
          uploading INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS damasset (
          folder TEXT NOT NULL,
          resourcemainid TEXT NOT NULL,
          fullfilepath TEXT NOT NULL,
          filename TEXT NOT NULL,
          initialmd5 TEXT,
          initialversion INTEGER NOT NULL DEFAULT 0,
          modified INTEGER NOT NULL DEFAULT 0,
          islatest INTEGER NOT NULL DEFAULT 1,
          created TEXT NOT NULL,
          updated TEXT NOT NULL,
          importanttouser INTEGER NOT NULL DEFAULT 0,
          PRIMARY KEY (folder, resourcemainid)
        );

        CREATE TABLE IF NOT EXISTS mirrorstate (
          templateid TEXT PRIMARY KEY,
          filepath TEXT NOT NULL,
          updated TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS log (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          message TEXT NOT NULL,
          messagetime TEXT NOT NULL,
          fromcomponent TEXT NOT NULL,
          focusticket TEXT NOT NULL DEFAULT '',
          logtype TEXT NOT NULL
        );
        "#,
    )?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}
