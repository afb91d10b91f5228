//! The `status()` control-surface snapshot (§6).

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::broker::ConnectionState;
use crate::queue::PublishQueue;

/// Point-in-time view of the agent's health, handed to the admin
/// collaborator by [`crate::control::AgentHandle::status`].
#[derive(Debug, Clone)]
pub struct QueueStatus {
    /// Effective liveness: raw transport state is `Connected` *and*
    /// `last_activity` hasn't gone stale (§9's "effective state").
    pub connected: bool,
    /// Raw §4.3 transport state, reported alongside `connected` rather
    /// than collapsed into it, per §9.
    pub transport_state: ConnectionState,
    pub uptime: Duration,
    pub processed_count: i64,
    pub main_queue_capacity: usize,
    pub overflow_len: usize,
    pub overflow_high_water: i64,
    pub pending_count: i64,
    pub sent_count_unavailable: bool,
    pub ping: Option<Duration>,
}

pub(super) async fn build(queue: &PublishQueue) -> QueueStatus {
    let pending_count = queue.ledger.count_pending().await.unwrap_or(-1);
    let ping = queue.broker.ping().await.ok();

    QueueStatus {
        connected: queue.broker.is_connected(),
        transport_state: queue.broker.connection_state(),
        uptime: queue.started_at.elapsed(),
        processed_count: queue.processed_count.load(Ordering::Relaxed),
        main_queue_capacity: crate::constants::MAIN_CHANNEL_CAPACITY,
        overflow_len: queue.overflow_len(),
        overflow_high_water: queue.overflow_high_water.load(Ordering::Relaxed),
        pending_count,
        sent_count_unavailable: pending_count < 0,
        ping,
    }
}
