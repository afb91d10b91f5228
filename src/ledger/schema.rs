//! Idempotent DDL for the ledger schema (§3, §6 "Ledger schema").
//!
//! One schema version; applied with `CREATE TABLE IF NOT EXISTS` at startup,
//! the way `polkadot-evm-frontier`'s SQL backend applies its own fixed
//! schema — no migration framework, since this agent never needs to evolve
//! the shape of these four tables independently of a full redeploy.

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS pending_message (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    topic             TEXT    NOT NULL,
    payload           BLOB    NOT NULL,
    timestamp         TEXT    NOT NULL,
    sent              INTEGER NOT NULL DEFAULT 0,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    connection_state  INTEGER NOT NULL DEFAULT 0,
    processing        INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pending_message_unsent
    ON pending_message (sent, processing, id);

CREATE TABLE IF NOT EXISTS processed_file (
    date_folder  TEXT NOT NULL,
    filename     TEXT NOT NULL,
    data_json    TEXT NOT NULL,
    processed_at TEXT NOT NULL,
    PRIMARY KEY (date_folder, filename)
);

CREATE TABLE IF NOT EXISTS synced_folder (
    folder_name   TEXT PRIMARY KEY,
    last_checked  TEXT    NOT NULL,
    fully_synced  INTEGER NOT NULL DEFAULT 0,
    total_files   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS setting (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
