//! Broker client (C3): a publish/subscribe transport wrapper exposing
//! connection state to C4's connection monitor.

mod mqtt;

#[cfg(any(test, feature = "test-util"))]
mod fake;

pub use mqtt::MqttBrokerClient;

/// In-memory broker double, built for unit tests and exercised again by
/// the end-to-end scenarios in `tests/` (enabled there via the
/// `test-util` feature, the way a self-referencing dev-dependency
/// exposes test-only API without leaking it into normal builds).
#[cfg(any(test, feature = "test-util"))]
pub use fake::FakeBrokerClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::PublishError;

/// The state machine in §4.3: `Disconnected -> Connecting -> Connected`,
/// collapsing back to `Disconnected` on `disconnect()` or network loss.
///
/// This is the *raw* transport state. §9 asks implementers to expose it
/// alongside the *effective* state (whether the link is actually live,
/// accounting for `last_activity` staleness) — the connection monitor
/// (`queue::workers::connection_monitor`) and the `status()` snapshot both
/// report the two side by side rather than collapsing them into one bool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// The seam C4 publishes through. Implementations own their transport's
/// connection lifecycle; callers only ever see `publish`/`isConnected`.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Fire-and-forget (re)connect attempt. Idempotent — calling it while
    /// already connected or connecting is a no-op.
    async fn connect(&self);

    /// Close the active session, if any.
    async fn disconnect(&self);

    /// Publish `payload` to `topic`. Must never block past the configured
    /// network timeout (§4.3); a timeout surfaces as
    /// `PublishError::Timeout`.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;

    /// Like `publish`, but never retried by the caller and logged at a
    /// lower level on failure — heartbeats are diagnostic, not durable.
    async fn publish_heartbeat(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;

    /// Raw transport state (§4.3's state machine). `is_connected` is the
    /// convenience bool derived from this for call sites that don't care
    /// about the `Connecting` transition.
    fn connection_state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool;

    /// Timestamp of the last successful publish or received broker ack.
    fn last_activity(&self) -> DateTime<Utc>;

    /// Round-trip latency of a lightweight liveness probe.
    async fn ping(&self) -> Result<Duration, PublishError>;
}
