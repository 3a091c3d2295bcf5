//! DAM Client Cache - changeset exchange for disconnected editors
//!
//! This crate keeps one directory tree per ticket on the server, hands
//! clients a compressed snapshot (precache) before they edit offline and
//! safely expands the edited snapshot (postcache) they send back.

pub mod audit;
pub mod bundle;
pub mod config;
pub mod exchange;
pub mod extract;
pub mod lock;
pub mod logging;
pub mod paths;
pub mod search;
pub mod server;

pub use audit::AuditLog;
pub use bundle::{PrecacheArchive, PrecacheBuilder};
pub use config::ServerConfig;
pub use exchange::{ExchangeContext, ExchangeError, UploadOutcome, UploadSession};
pub use extract::{Extractor, PartialExtract};
pub use lock::ChangesetLock;
pub use paths::PathResolver;
