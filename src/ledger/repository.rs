//! The ledger's repository seam (§4.1).
//!
//! `Repository` is the one door C4 and C5 use to reach persistent state;
//! neither component ever touches the SQL layer directly. Object-safe and
//! `async_trait`-based, the way the teacher crate puts an `async_trait` seam
//! in front of its `Channel` implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::LedgerError;
use crate::ledger::models::{PendingMessage, ProcessedFile, SyncedFolder};

#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert a new pending message row. Returns the assigned id.
    async fn insert_pending(
        &self,
        topic: &str,
        payload: &[u8],
        connection_state: bool,
    ) -> Result<i64, LedgerError>;

    /// Oldest-first rows where `sent = false AND processing = false`.
    async fn get_pending_batch(&self, limit: i64) -> Result<Vec<PendingMessage>, LedgerError>;

    /// Conditional `processing: false -> true`. Returns the row iff the
    /// transition occurred — this is the lease (§9 "Lease via
    /// `markProcessing`").
    async fn mark_processing(&self, id: i64) -> Result<Option<PendingMessage>, LedgerError>;

    /// Set `sent = true, processing = false`. Only ever called after a
    /// confirmed broker ack (I6).
    async fn mark_sent(&self, id: i64) -> Result<(), LedgerError>;

    /// Re-read one row (used by the dedup check before publishing).
    async fn get_pending(&self, id: i64) -> Result<Option<PendingMessage>, LedgerError>;

    /// Reset `processing = false` for every row. Called once at C4 startup
    /// to recover leases stranded by a prior crash (I2).
    async fn reset_processing(&self) -> Result<u64, LedgerError>;

    /// Count of rows with `sent = false`.
    async fn count_pending(&self) -> Result<i64, LedgerError>;

    /// Whether any `sent = false` row is older than `older_than`.
    async fn has_old_pending(&self, older_than: DateTime<Utc>) -> Result<bool, LedgerError>;

    /// Record that a file was decoded and enqueued, in the same transaction
    /// as the `pending_message` insert for it (I3). Fails with
    /// `LedgerError::Duplicate` if the `(folder, filename)` key already
    /// exists — callers treat that as success (idempotent recovery, §7).
    ///
    /// `filename` is the folder-prefixed relative path (`20240115/evt1.json.bson`),
    /// matching §8.1's key tuple and the outbound envelope's `filename` field —
    /// not the bare on-disk basename.
    async fn record_processed_file_and_enqueue(
        &self,
        folder: &str,
        filename: &str,
        data_json: &str,
        topic: &str,
        payload: &[u8],
        connection_state: bool,
    ) -> Result<i64, LedgerError>;

    /// Whether `(folder, filename)` already has a `processed_file` row.
    async fn is_file_processed(&self, folder: &str, filename: &str) -> Result<bool, LedgerError>;

    /// Upsert the `synced_folder` summary row for `folder`.
    async fn upsert_synced_folder(
        &self,
        folder: &str,
        total_files: i64,
        fully_synced: bool,
    ) -> Result<(), LedgerError>;

    /// All `synced_folder` rows (backs the folder-summary control operation).
    async fn list_synced_folders(&self) -> Result<Vec<SyncedFolder>, LedgerError>;

    /// Read a single `processed_file` row, if present (backs `fileStatus`).
    async fn get_processed_file(
        &self,
        folder: &str,
        filename: &str,
    ) -> Result<Option<ProcessedFile>, LedgerError>;

    /// Pending/sent rows whose payload contains `needle` as a substring
    /// (backs `fileStatus`: find the message(s) enqueued for a given file).
    async fn find_pending_by_payload_substring(
        &self,
        needle: &str,
    ) -> Result<Vec<PendingMessage>, LedgerError>;

    /// Read a setting value written by the external identity collaborator.
    async fn get_setting(&self, key: &str) -> Result<Option<String>, LedgerError>;

    /// Filenames already recorded as processed for `folder` (backs the
    /// periodic rescan's on-disk vs. ledger diff, §4.5 path B).
    async fn list_processed_filenames(&self, folder: &str) -> Result<Vec<String>, LedgerError>;
}
