//! Row types for the ledger tables (§3).

use chrono::{DateTime, Utc};

/// A row in `pending_message`.
///
/// Invariants (see specification §3):
/// - `sent = true` is terminal: C4 never re-publishes a sent row (I1).
/// - `processing = true` is a transient lease; reset to `false` for every
///   row at C4 startup (I2) so a crash mid-lease doesn't strand the row.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Opaque monotonic id assigned on insert.
    pub id: i64,
    /// Routing key for the broker publish.
    pub topic: String,
    /// Opaque encoded message body. Immutable after insert.
    pub payload: Vec<u8>,
    /// Wall-clock insert time.
    pub timestamp: DateTime<Utc>,
    /// Whether the broker has acknowledged this message.
    pub sent: bool,
    /// Number of publish attempts made so far.
    pub retry_count: i64,
    /// Snapshot of the broker connection state at insert time (diagnostic only).
    pub connection_state: bool,
    /// Transient lease flag; `true` while a worker owns this row.
    pub processing: bool,
}

/// A row in `processed_file`.
///
/// Presence of a row means the file was decoded AND a `pending_message` was
/// enqueued for it in the same transaction (I3) — it is never recorded for
/// a file that failed to decode.
#[derive(Debug, Clone)]
pub struct ProcessedFile {
    /// `YYYYMMDD` directory name the file was found in.
    pub date_folder: String,
    /// Filename relative to `date_folder`.
    pub filename: String,
    /// Compact JSON summary of the decoded payload, for audit.
    pub data_json: String,
    /// When this file was processed.
    pub processed_at: DateTime<Utc>,
}

/// A row in `synced_folder`.
///
/// `fully_synced = true` implies every `*.json.bson` file present at the
/// last check has a matching `ProcessedFile` row (I4) — advisory, not
/// authoritative; the per-file check in `processed_file` always wins.
#[derive(Debug, Clone)]
pub struct SyncedFolder {
    /// The `YYYYMMDD` folder name.
    pub folder_name: String,
    /// When this folder was last scanned.
    pub last_checked: DateTime<Utc>,
    /// Whether every on-disk file had a matching processed-file row as of
    /// `last_checked`.
    pub fully_synced: bool,
    /// Number of eligible files seen on disk at the last check.
    pub total_files: i64,
}
