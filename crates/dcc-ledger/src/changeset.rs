//! Changesets and the folder pool.

use chrono::NaiveDate;
use dcc_protocol::ChangeStatus;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{LedgerError, LedgerResult};
use crate::state::ChangesetState;
use crate::Ledger;

/// A changeset row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset {
    pub ticket: String,
    pub folder: String,
    pub description: String,
    pub lead: String,
    pub assignee: String,
    pub target_start: Option<NaiveDate>,
    pub target_repository_end: Option<NaiveDate>,
    pub target_end: Option<NaiveDate>,
    pub percentage_complete: String,
    pub implementation_notes: String,
    pub active: bool,
    pub uploading: bool,
    pub ready: bool,
}

impl Changeset {
    /// Status flags as reported to clients.
    pub fn status(&self) -> ChangeStatus {
        ChangeStatus {
            active: self.active,
            uploading: self.uploading,
            ready: self.ready,
        }
    }

    /// Derived lifecycle state.
    pub fn state(&self) -> ChangesetState {
        ChangesetState::from_status(&self.status())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            ticket: row.get("jirakey")?,
            folder: row.get("folder")?,
            description: row.get("description")?,
            lead: row.get("lead")?,
            assignee: row.get("jiraassignee")?,
            target_start: row.get("targetstartdate")?,
            target_repository_end: row.get("targetrepositoryenddate")?,
            target_end: row.get("targetenddate")?,
            percentage_complete: row.get("percentagecomplete")?,
            implementation_notes: row.get("implementationnotes")?,
            active: row.get("active")?,
            uploading: row.get("uploading")?,
            ready: row.get("state_ready")?,
        })
    }
}

const CHANGESET_COLUMNS: &str = r#"jirakey, folder, description, "lead", jiraassignee,
    targetstartdate, targetrepositoryenddate, targetenddate, percentagecomplete,
    implementationnotes, active, uploading, state_ready"#;

/// Input to [`Ledger::link_changeset`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkRequest {
    pub ticket: String,
    pub description: String,
    pub lead: String,
    pub assignee: String,
}

impl Ledger {
    /// Add a folder to the pool of unlinked folders.
    ///
    /// Returns false if the folder was already registered.
    pub fn register_folder(&self, folder: &str) -> LedgerResult<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO damfolder (folder, jirakey) VALUES (?1, '')",
            params![folder],
        )?;
        Ok(inserted == 1)
    }

    /// Number of folders still waiting for a ticket.
    pub fn unlinked_folder_count(&self) -> LedgerResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM damfolder WHERE jirakey = ''",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Ticket linked to `folder`, if any.
    pub fn ticket_for_folder(&self, folder: &str) -> LedgerResult<Option<String>> {
        let conn = self.lock()?;
        let ticket: Option<String> = conn
            .query_row(
                "SELECT jirakey FROM damfolder WHERE folder = ?1 AND jirakey <> ''",
                params![folder],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ticket)
    }

    /// Link the first unlinked folder to a ticket and create its changeset.
    ///
    /// The folder↔ticket association is permanent, so a ticket that already
    /// owns a folder is rejected with `AlreadyLinked`. Returns the folder key.
    pub fn link_changeset(&self, request: &LinkRequest) -> LedgerResult<String> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT folder FROM damfolder WHERE jirakey = ?1",
                params![request.ticket],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(folder) = existing {
            return Err(LedgerError::AlreadyLinked {
                ticket: request.ticket.clone(),
                folder,
            });
        }

        let folder: String = tx
            .query_row(
                "SELECT folder FROM damfolder WHERE jirakey = '' ORDER BY folder LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(LedgerError::NoUnlinkedFolder)?;

        let linked = tx.execute(
            "UPDATE damfolder SET jirakey = ?1 WHERE folder = ?2 AND jirakey = ''",
            params![request.ticket, folder],
        )?;
        if linked != 1 {
            return Err(LedgerError::NoUnlinkedFolder);
        }

        tx.execute(
            r#"INSERT INTO "change"
               (jirakey, folder, description, "lead", jiraassignee,
                targetstartdate, targetrepositoryenddate, targetenddate,
                percentagecomplete, active, implementationnotes, state_ready, uploading)
               VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, '', 1, '', 0, 0)"#,
            params![
                request.ticket,
                folder,
                request.description,
                request.lead,
                request.assignee
            ],
        )?;
        tx.commit()?;

        info!(ticket = %request.ticket, folder = %folder, "changeset linked");
        Ok(folder)
    }

    /// Set the ready flag of every changeset linked to `folder`.
    ///
    /// Returns the number of changesets updated; zero is not an error.
    pub fn set_ready(&self, folder: &str, ready: bool) -> LedgerResult<usize> {
        let conn = self.lock()?;
        let updated = conn.execute(
            r#"UPDATE "change" SET state_ready = ?1
               WHERE jirakey IN (
                 SELECT jirakey FROM damfolder WHERE folder = ?2 AND jirakey <> ''
               )"#,
            params![ready, folder],
        )?;
        debug!(folder, ready, updated, "ready flag updated");
        Ok(updated)
    }

    /// Status flags for a ticket; an unknown ticket reports all false.
    pub fn query_status(&self, ticket: &str) -> LedgerResult<ChangeStatus> {
        let conn = self.lock()?;
        let status = conn
            .query_row(
                r#"SELECT active, uploading, state_ready FROM "change" WHERE jirakey = ?1"#,
                params![ticket],
                |row| {
                    Ok(ChangeStatus {
                        active: row.get(0)?,
                        uploading: row.get(1)?,
                        ready: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(status.unwrap_or_default())
    }

    /// Lifecycle state for a ticket.
    pub fn state(&self, ticket: &str) -> LedgerResult<ChangesetState> {
        Ok(ChangesetState::from_status(&self.query_status(ticket)?))
    }

    /// Full changeset row for a ticket.
    pub fn changeset(&self, ticket: &str) -> LedgerResult<Option<Changeset>> {
        let conn = self.lock()?;
        let sql = format!(r#"SELECT {} FROM "change" WHERE jirakey = ?1"#, CHANGESET_COLUMNS);
        Ok(conn
            .query_row(&sql, params![ticket], Changeset::from_row)
            .optional()?)
    }

    /// Full changeset row for a folder.
    pub fn changeset_for_folder(&self, folder: &str) -> LedgerResult<Option<Changeset>> {
        let conn = self.lock()?;
        let sql = format!(r#"SELECT {} FROM "change" WHERE folder = ?1"#, CHANGESET_COLUMNS);
        Ok(conn
            .query_row(&sql, params![folder], Changeset::from_row)
            .optional()?)
    }

    /// Start the upload bracket for a folder.
    ///
    /// The flag is flipped with a conditional update so exactly one caller
    /// wins when several uploads race; the rest get `UploadInProgress`.
    pub fn begin_upload(&self, folder: &str) -> LedgerResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status = tx
            .query_row(
                r#"SELECT active, uploading, state_ready FROM "change" WHERE folder = ?1"#,
                params![folder],
                |row| {
                    Ok(ChangeStatus {
                        active: row.get(0)?,
                        uploading: row.get(1)?,
                        ready: row.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| LedgerError::NotFound(folder.to_string()))?;

        let from = ChangesetState::from_status(&status);
        if from == ChangesetState::Uploading {
            return Err(LedgerError::UploadInProgress(folder.to_string()));
        }
        if !from.can_transition_to(ChangesetState::Uploading) {
            return Err(LedgerError::InvalidTransition {
                from,
                to: ChangesetState::Uploading,
            });
        }

        let claimed = tx.execute(
            r#"UPDATE "change" SET uploading = 1 WHERE folder = ?1 AND uploading = 0"#,
            params![folder],
        )?;
        if claimed != 1 {
            return Err(LedgerError::UploadInProgress(folder.to_string()));
        }
        tx.commit()?;

        debug!(folder, "upload bracket opened");
        Ok(())
    }

    /// End the upload bracket for a folder. Safe to call more than once.
    pub fn finish_upload(&self, folder: &str) -> LedgerResult<()> {
        let conn = self.lock()?;
        let cleared = conn.execute(
            r#"UPDATE "change" SET uploading = 0 WHERE folder = ?1"#,
            params![folder],
        )?;
        debug!(folder, cleared, "upload bracket closed");
        Ok(())
    }

    /// Clear every `uploading` flag left by a previous process.
    ///
    /// Only safe before any upload is served. Returns the folders cleared.
    pub fn clear_stale_uploads(&self) -> LedgerResult<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let folders = {
            let mut stmt = tx.prepare(
                r#"SELECT folder FROM "change" WHERE uploading = 1 ORDER BY folder"#,
            )?;
            let folders = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            folders
        };
        tx.execute(r#"UPDATE "change" SET uploading = 0 WHERE uploading = 1"#, [])?;
        tx.commit()?;

        if !folders.is_empty() {
            info!(count = folders.len(), "stale upload brackets cleared");
        }
        Ok(folders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_folders(folders: &[&str]) -> Ledger {
        let ledger = Ledger::open_in_memory().unwrap();
        for folder in folders {
            ledger.register_folder(folder).unwrap();
        }
        ledger
    }

    fn link(ledger: &Ledger, ticket: &str) -> LedgerResult<String> {
        ledger.link_changeset(&LinkRequest {
            ticket: ticket.to_string(),
            description: "Update archetypes".to_string(),
            lead: "lead".to_string(),
            assignee: "assignee".to_string(),
        })
    }

    #[test]
    fn test_register_folder_idempotent() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert!(ledger.register_folder("F1").unwrap());
        assert!(!ledger.register_folder("F1").unwrap());
        assert_eq!(ledger.unlinked_folder_count().unwrap(), 1);
    }

    #[test]
    fn test_link_then_status_is_active() {
        let ledger = ledger_with_folders(&["F1"]);

        let folder = link(&ledger, "JIRA-100").unwrap();
        assert_eq!(folder, "F1");

        let status = ledger.query_status("JIRA-100").unwrap();
        assert_eq!(
            status,
            ChangeStatus {
                active: true,
                uploading: false,
                ready: false
            }
        );
        assert_eq!(ledger.state("JIRA-100").unwrap(), ChangesetState::Active);
        assert_eq!(ledger.ticket_for_folder("F1").unwrap().as_deref(), Some("JIRA-100"));
        assert_eq!(ledger.unlinked_folder_count().unwrap(), 0);
    }

    #[test]
    fn test_link_takes_first_unlinked_folder() {
        let ledger = ledger_with_folders(&["F2", "F1", "F3"]);
        assert_eq!(link(&ledger, "JIRA-1").unwrap(), "F1");
        assert_eq!(link(&ledger, "JIRA-2").unwrap(), "F2");
        assert_eq!(link(&ledger, "JIRA-3").unwrap(), "F3");
        assert!(matches!(link(&ledger, "JIRA-4"), Err(LedgerError::NoUnlinkedFolder)));
    }

    #[test]
    fn test_link_same_ticket_twice_is_already_linked() {
        let ledger = ledger_with_folders(&["F1", "F2"]);
        link(&ledger, "JIRA-100").unwrap();

        match link(&ledger, "JIRA-100") {
            Err(LedgerError::AlreadyLinked { ticket, folder }) => {
                assert_eq!(ticket, "JIRA-100");
                assert_eq!(folder, "F1");
            }
            other => panic!("expected AlreadyLinked, got {:?}", other),
        }
        // The second folder stays in the pool.
        assert_eq!(ledger.unlinked_folder_count().unwrap(), 1);
    }

    #[test]
    fn test_changeset_row_contents() {
        let ledger = ledger_with_folders(&["F1"]);
        link(&ledger, "JIRA-100").unwrap();

        let changeset = ledger.changeset("JIRA-100").unwrap().unwrap();
        assert_eq!(changeset.folder, "F1");
        assert_eq!(changeset.description, "Update archetypes");
        assert_eq!(changeset.lead, "lead");
        assert_eq!(changeset.assignee, "assignee");
        assert!(changeset.target_end.is_none());
        assert_eq!(changeset.state(), ChangesetState::Active);

        let by_folder = ledger.changeset_for_folder("F1").unwrap().unwrap();
        assert_eq!(by_folder, changeset);
        assert!(ledger.changeset("JIRA-404").unwrap().is_none());
    }

    #[test]
    fn test_unknown_ticket_status_is_all_false() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert_eq!(ledger.query_status("NOPE-1").unwrap(), ChangeStatus::default());
        assert_eq!(ledger.state("NOPE-1").unwrap(), ChangesetState::Draft);
    }

    #[test]
    fn test_set_ready_through_folder() {
        let ledger = ledger_with_folders(&["F1"]);
        link(&ledger, "JIRA-100").unwrap();

        assert_eq!(ledger.set_ready("F1", true).unwrap(), 1);
        assert!(ledger.query_status("JIRA-100").unwrap().ready);
        assert_eq!(ledger.state("JIRA-100").unwrap(), ChangesetState::Ready);

        assert_eq!(ledger.set_ready("F1", false).unwrap(), 1);
        assert!(!ledger.query_status("JIRA-100").unwrap().ready);
    }

    #[test]
    fn test_set_ready_unknown_folder_is_noop() {
        let ledger = ledger_with_folders(&["F1"]);
        // F1 is registered but unlinked; nothing matches.
        assert_eq!(ledger.set_ready("F1", true).unwrap(), 0);
        assert_eq!(ledger.set_ready("F404", true).unwrap(), 0);
    }

    #[test]
    fn test_upload_bracket() {
        let ledger = ledger_with_folders(&["F1"]);
        link(&ledger, "JIRA-100").unwrap();

        ledger.begin_upload("F1").unwrap();
        assert!(ledger.query_status("JIRA-100").unwrap().uploading);
        assert_eq!(ledger.state("JIRA-100").unwrap(), ChangesetState::Uploading);

        assert!(matches!(
            ledger.begin_upload("F1"),
            Err(LedgerError::UploadInProgress(_))
        ));

        ledger.finish_upload("F1").unwrap();
        ledger.finish_upload("F1").unwrap();
        assert!(!ledger.query_status("JIRA-100").unwrap().uploading);

        // Can upload again once the bracket is closed.
        ledger.begin_upload("F1").unwrap();
    }

    #[test]
    fn test_upload_preserves_ready_flag() {
        let ledger = ledger_with_folders(&["F1"]);
        link(&ledger, "JIRA-100").unwrap();
        ledger.set_ready("F1", true).unwrap();

        ledger.begin_upload("F1").unwrap();
        ledger.finish_upload("F1").unwrap();
        assert_eq!(ledger.state("JIRA-100").unwrap(), ChangesetState::Ready);
    }

    #[test]
    fn test_begin_upload_unlinked_folder_not_found() {
        let ledger = ledger_with_folders(&["F1"]);
        assert!(matches!(ledger.begin_upload("F1"), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_concurrent_begin_upload_exactly_one_wins() {
        use std::sync::Arc;
        use std::thread;

        let ledger = Arc::new(ledger_with_folders(&["F1"]));
        link(&ledger, "JIRA-100").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || ledger.begin_upload("F1").is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_clear_stale_uploads() {
        let ledger = ledger_with_folders(&["F1", "F2"]);
        link(&ledger, "JIRA-1").unwrap();
        link(&ledger, "JIRA-2").unwrap();
        ledger.set_ready("F2", true).unwrap();
        ledger.begin_upload("F2").unwrap();

        assert_eq!(ledger.clear_stale_uploads().unwrap(), vec!["F2".to_string()]);
        assert!(ledger.clear_stale_uploads().unwrap().is_empty());
        assert_eq!(ledger.state("JIRA-2").unwrap(), ChangesetState::Ready);
        ledger.begin_upload("F2").unwrap();
    }

    #[test]
    fn test_stale_upload_survives_reopen_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dcc.sqlite");
        {
            let ledger = Ledger::open(&path).unwrap();
            ledger.register_folder("F1").unwrap();
            link(&ledger, "JIRA-1").unwrap();
            ledger.begin_upload("F1").unwrap();
        }

        let ledger = Ledger::open(&path).unwrap();
        assert!(matches!(
            ledger.begin_upload("F1"),
            Err(LedgerError::UploadInProgress(_))
        ));
        assert_eq!(ledger.clear_stale_uploads().unwrap(), vec!["F1".to_string()]);
        ledger.begin_upload("F1").unwrap();
    }
}
