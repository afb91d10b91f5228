//! Typed error taxonomy for the core subsystems.
//!
//! `anyhow::Error` is used at application edges (CLI commands, `main`); the
//! types here exist for the call sites in C1–C5 that need to match on *which*
//! failure happened (dedup vs. abort, retry vs. drop) per the error policy
//! table in the specification.

use thiserror::Error;

/// Failures from the ledger store (C1).
///
/// `send()` surfaces this directly to producers — it is the only error a
/// producer can ever see, per the error-handling design: a broker failure
/// never reaches the caller of `send`.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// `record_processed_file` raced with another writer for the same
    /// `(date_folder, filename)` key. Callers should treat this as success.
    #[error("processed_file already recorded for {folder}/{filename}")]
    Duplicate {
        /// Date folder component of the natural key.
        folder: String,
        /// Filename component of the natural key.
        filename: String,
    },

    /// Any other persistence failure (I/O, pool exhaustion, malformed row).
    #[error("ledger store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Failures from decoding a record file (C2).
#[derive(Debug, Error)]
pub enum DecodeFailure {
    /// AEAD authentication failed: wrong key or tampered ciphertext.
    #[error("decrypt failed: {0}")]
    Decrypt(String),

    /// Plaintext was not a well-formed BSON document, or a required field
    /// was missing or the wrong type.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Failures from a broker publish attempt (C3).
#[derive(Debug, Error)]
pub enum PublishError {
    /// The client was not connected when `publish` was called.
    #[error("not connected to broker")]
    NotConnected,

    /// The publish call exceeded the configured network timeout.
    #[error("publish timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The transport rejected the publish (protocol error, QoS failure, …).
    #[error("broker rejected publish: {0}")]
    Rejected(String),
}

/// Failures detected while loading configuration at startup.
///
/// Always fatal: the agent refuses to start rather than run with an
/// incomplete or inconsistent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required value was absent from every source (file, env, flag).
    #[error("missing required configuration: {0}")]
    Missing(String),

    /// A value was present but failed to parse.
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid {
        /// Name of the offending configuration field.
        field: String,
        /// Human-readable reason the value was rejected.
        reason: String,
    },

    /// The configuration file existed but could not be read or parsed.
    #[error("failed to load config file: {0}")]
    Io(#[from] std::io::Error),
}
