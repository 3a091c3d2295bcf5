//! Audit log entries.

use chrono::{DateTime, Utc};
use rusqlite::params;
use std::fmt;

use crate::error::LedgerResult;
use crate::Ledger;

/// Severity of an audit log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn parse(value: &str) -> Self {
        match value.trim() {
            "DEBUG" => LogLevel::Debug,
            "WARN" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub message: String,
    pub time: DateTime<Utc>,
    /// Originating component and version, e.g. `dam-cache v0.1.0`
    pub component: String,
    /// Associated ticket or folder key; empty when not applicable
    pub ticket: String,
    pub level: LogLevel,
}

impl LogEntry {
    pub fn new(
        component: impl Into<String>,
        message: impl Into<String>,
        ticket: impl Into<String>,
        level: LogLevel,
    ) -> Self {
        Self {
            message: message.into(),
            time: Utc::now(),
            component: component.into(),
            ticket: ticket.into(),
            level,
        }
    }
}

impl Ledger {
    /// Append an audit entry.
    pub fn append_log(&self, entry: &LogEntry) -> LedgerResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO log (message, messagetime, fromcomponent, focusticket, logtype)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.message,
                entry.time,
                entry.component,
                entry.ticket,
                entry.level.as_str()
            ],
        )?;
        Ok(())
    }

    /// Most recent audit entries, newest first.
    pub fn recent_logs(&self, limit: usize) -> LedgerResult<Vec<LogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT message, messagetime, fromcomponent, focusticket, logtype
             FROM log ORDER BY id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], |row| {
                let level: String = row.get(4)?;
                Ok(LogEntry {
                    message: row.get(0)?,
                    time: row.get(1)?,
                    component: row.get(2)?,
                    ticket: row.get(3)?,
                    level: LogLevel::parse(&level),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger
            .append_log(&LogEntry::new("dam-cache v0.1.0", "first", "", LogLevel::Info))
            .unwrap();
        ledger
            .append_log(&LogEntry::new("dam-cache v0.1.0", "second", "F1", LogLevel::Error))
            .unwrap();

        let logs = ledger.recent_logs(10).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "second");
        assert_eq!(logs[0].ticket, "F1");
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(logs[1].level, LogLevel::Info);

        assert_eq!(ledger.recent_logs(1).unwrap().len(), 1);
    }

    #[test]
    fn test_level_strings() {
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
        assert_eq!(LogLevel::parse("WARN"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("whatever"), LogLevel::Info);
    }
}
