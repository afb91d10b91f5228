//! The ledger store (C1): the relational system of record for pending
//! messages, processed files, synced-folder summaries and settings.

mod models;
mod repository;
mod schema;
mod sqlite;

pub use models::{PendingMessage, ProcessedFile, SyncedFolder};
pub use repository::Repository;
pub use sqlite::SqliteLedger;
