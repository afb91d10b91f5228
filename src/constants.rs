//! Application-wide tunables for the sync agent.
//!
//! This module centralizes the magic numbers that govern C4's queue
//! behavior and C5's discovery cadence, grouped by subsystem.

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// User-Agent-equivalent string embedded in heartbeat/status payloads.
pub fn client_signature() -> String {
    format!("jarvist-sync-agent/{}", env!("CARGO_PKG_VERSION"))
}

// ============================================================================
// C4 Publish Queue
// ============================================================================

/// Capacity of the `main` bounded channel (§4.4).
pub const MAIN_CHANNEL_CAPACITY: usize = 1000;

/// Concurrent publishes permitted through `workerSem`.
pub const WORKER_SEMAPHORE_CAPACITY: usize = 5;

/// Pacing sleep after each message worker iteration, to avoid tight-loop
/// flooding of the broker.
pub const MESSAGE_WORKER_PACING: Duration = Duration::from_millis(50);

/// Overflow drain worker tick interval.
pub const OVERFLOW_DRAIN_INTERVAL: Duration = Duration::from_millis(500);

/// Timeout for a single overflow-to-main push attempt.
pub const OVERFLOW_PUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection monitor sampling interval.
pub const CONNECTION_MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// How long a connection may go without activity before the monitor
/// forces a reconnect, even if the transport still reports connected.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Consecutive failed health checks before the monitor forces a
/// disconnect + reconnect cycle.
pub const MAX_FAILED_HEALTH_CHECKS: u32 = 3;

/// Heartbeat publish interval while connected.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Page size for the pending scan's batches through C1.
pub const PENDING_SCAN_BATCH_SIZE: i64 = 20;

/// Delay before a pending scan that found remaining work reschedules
/// itself.
pub const PENDING_SCAN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on the shutdown drain loop over `main`/`overflow`.
pub const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(10);

/// Upper bound on waiting for workers to exit after cancellation.
pub const WORKER_JOIN_BUDGET: Duration = Duration::from_secs(10);

// ============================================================================
// C5 Ingest Pipeline
// ============================================================================

/// Capacity of the `pending_files` channel.
pub const PENDING_FILES_CAPACITY: usize = 256;

/// Minimum file size, in bytes, for a record file to be considered
/// eligible for processing.
pub const MIN_RECORD_FILE_SIZE: u64 = 100;

/// Watchdog sweep interval: re-subscribes dropped date-folder watches
/// and recreates a deleted spool root.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(600);

/// Retry delay when the watcher subsystem fails at construction.
pub const WATCHER_RECOVERY_RETRY: Duration = Duration::from_secs(30);

/// Upper bound on a single file's decode-and-enqueue work unit.
pub const FILE_PROCESSING_TIMEOUT: Duration = Duration::from_secs(120);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_tunables_are_internally_consistent() {
        assert!(WORKER_SEMAPHORE_CAPACITY < MAIN_CHANNEL_CAPACITY);
        assert!(OVERFLOW_PUSH_TIMEOUT < SHUTDOWN_DRAIN_BUDGET);
        assert!(HEARTBEAT_INTERVAL < CONNECTION_TIMEOUT);
    }

    #[test]
    fn client_signature_includes_the_crate_version() {
        assert!(client_signature().starts_with("jarvist-sync-agent/"));
    }
}
