//! Audit log
//!
//! Appends log entries to the ledger's `log` table. Appends are best-effort:
//! a failed append is reported through `tracing` and never fails the
//! operation that triggered it.

use std::sync::Arc;

use dcc_ledger::{Ledger, LogEntry, LogLevel};
use dcc_protocol::COMPONENT_NAME;
use tracing::warn;

/// `dam-cache v<crate version>`
pub fn component() -> String {
    format!("{} v{}", COMPONENT_NAME, env!("CARGO_PKG_VERSION"))
}

/// Best-effort writer of audit entries
#[derive(Debug, Clone)]
pub struct AuditLog {
    ledger: Arc<Ledger>,
    component: String,
}

impl AuditLog {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            component: component(),
        }
    }

    /// Append an entry; failures are logged and swallowed.
    pub fn record(&self, level: LogLevel, ticket: &str, message: impl Into<String>) {
        let entry = LogEntry::new(self.component.as_str(), message, ticket, level);
        if let Err(e) = self.ledger.append_log(&entry) {
            warn!(error = %e, ticket, message = %entry.message, "audit log append failed");
        }
    }

    pub fn debug(&self, ticket: &str, message: impl Into<String>) {
        self.record(LogLevel::Debug, ticket, message);
    }

    pub fn info(&self, ticket: &str, message: impl Into<String>) {
        self.record(LogLevel::Info, ticket, message);
    }

    pub fn error(&self, ticket: &str, message: impl Into<String>) {
        self.record(LogLevel::Error, ticket, message);
    }
}
