//! The five long-running workers behind [`super::PublishQueue`] (§4.4).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::constants::{
    CONNECTION_MONITOR_INTERVAL, CONNECTION_TIMEOUT, HEARTBEAT_INTERVAL, MAX_FAILED_HEALTH_CHECKS,
    OVERFLOW_DRAIN_INTERVAL, OVERFLOW_PUSH_TIMEOUT, PENDING_SCAN_BATCH_SIZE,
    PENDING_SCAN_RETRY_DELAY, SHUTDOWN_DRAIN_BUDGET,
};

use super::PublishQueue;

impl PublishQueue {
    /// Pops leased ids from `main`, checks the `sent` dedup flag, and
    /// publishes through C3 — one spawned task per id so the worker's
    /// receive loop isn't blocked on a slow publish, with concurrency
    /// bounded by `worker_sem` (§4.4 item 1).
    pub(super) async fn message_worker(self: Arc<Self>) {
        let mut rx = self
            .main_rx
            .lock()
            .unwrap()
            .take()
            .expect("message worker spawned more than once");

        let mut drain_deadline: Option<tokio::time::Instant> = None;

        loop {
            if self.shutdown.is_cancelled() && drain_deadline.is_none() {
                drain_deadline = Some(tokio::time::Instant::now() + SHUTDOWN_DRAIN_BUDGET);
            }

            let received = match drain_deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, rx.recv())
                    .await
                    .ok()
                    .flatten(),
                None => rx.recv().await,
            };

            let Some(id) = received else { break };

            let permit = match self.worker_sem.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let worker = self.clone();
            tokio::spawn(async move { worker.publish_one(id, permit).await });

            if drain_deadline.is_none() {
                tokio::time::sleep(crate::constants::MESSAGE_WORKER_PACING).await;
            }
        }
    }

    /// Publish attempt for a single leased id. Guarded by `scopeguard` so a
    /// panic mid-publish still requeues the id rather than stranding it
    /// in neither `main`/`overflow` nor a follow-up pending scan.
    async fn publish_one(self: Arc<Self>, id: i64, _permit: tokio::sync::OwnedSemaphorePermit) {
        let queue_for_guard = self.clone();
        let mut accounted = scopeguard::guard(false, move |accounted| {
            if !accounted {
                queue_for_guard.enqueue_sync(id);
            }
        });

        let row = match self.ledger.get_pending(id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                *accounted = true;
                return;
            }
            Err(err) => {
                log::error!("failed to re-read pending message {id}: {err}");
                // LedgerError policy (§7): abort, don't advance state. The
                // row's lease is left in place for the next restart's
                // reset_processing rather than retried immediately.
                *accounted = true;
                return;
            }
        };

        if row.sent {
            // Dedup: a concurrent pending scan already republished and
            // this copy lost the race.
            *accounted = true;
            return;
        }

        match self.broker.publish(&row.topic, &row.payload).await {
            Ok(()) => {
                if let Err(err) = self.ledger.mark_sent(id).await {
                    log::error!("failed to mark message {id} sent after broker ack: {err}");
                }
                self.processed_count.fetch_add(1, Ordering::Relaxed);
                *accounted = true;
            }
            Err(err) => {
                log::warn!("publish failed for pending message {id}: {err}");
                self.enqueue_sync(id);
                *accounted = true;
            }
        }
    }

    /// Every `OVERFLOW_DRAIN_INTERVAL`, tries to move the head of
    /// `overflow` into `main` (§4.4 item 2).
    pub(super) async fn overflow_drain_worker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(OVERFLOW_DRAIN_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let head = self.overflow.lock().unwrap().pop_front();
            let Some(id) = head else { continue };

            let reserved =
                tokio::time::timeout(OVERFLOW_PUSH_TIMEOUT, self.main_tx.reserve()).await;

            match reserved {
                Ok(Ok(permit)) => permit.send(id),
                _ => self.overflow.lock().unwrap().push_front(id),
            }
        }
    }

    /// Samples `C3.isConnected()`, drives reconnect on staleness or
    /// repeated failure, and triggers a pending scan on a
    /// disconnected->connected transition (§4.4 item 3).
    pub(super) async fn connection_monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(CONNECTION_MONITOR_INTERVAL);
        let mut was_connected = self.broker.is_connected();
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let connected = self.broker.is_connected();

            if connected && !was_connected {
                self.trigger_pending_scan();
            }

            if connected {
                let idle = Utc::now().signed_duration_since(self.broker.last_activity());
                let timeout = chrono::Duration::from_std(CONNECTION_TIMEOUT).unwrap_or_default();
                if idle > timeout {
                    log::warn!("broker link idle for {}s, forcing reconnect", idle.num_seconds());
                    self.broker.disconnect().await;
                    self.broker.connect().await;
                }
                consecutive_failures = 0;
            } else {
                consecutive_failures += 1;
                if consecutive_failures >= MAX_FAILED_HEALTH_CHECKS {
                    log::warn!(
                        "broker link failed {consecutive_failures} consecutive health checks, forcing reconnect"
                    );
                    self.broker.disconnect().await;
                    self.broker.connect().await;
                    consecutive_failures = 0;
                }
            }

            log::debug!(
                "queue status: connected={connected} transport_state={} overflow_len={} pending={:?}",
                self.broker.connection_state(),
                self.overflow_len(),
                self.ledger.count_pending().await,
            );

            was_connected = connected;
        }
    }

    /// Publishes a heartbeat envelope to `<base>/heartbeat` every
    /// `HEARTBEAT_INTERVAL` while connected (§4.4 item 4).
    pub(super) async fn heartbeat_worker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.broker.is_connected() {
                continue;
            }

            let payload = json!({
                "type": "heartbeat",
                "client_id": self.client_id,
                "agent": crate::constants::client_signature(),
                "timestamp": Utc::now().to_rfc3339(),
                "random_id": Uuid::new_v4().to_string(),
            })
            .to_string();

            let topic = format!("{}/heartbeat", self.base_topic);
            if let Err(err) = self.broker.publish_heartbeat(&topic, payload.as_bytes()).await {
                log::debug!("heartbeat publish failed: {err}");
            }
        }
    }

    /// Pages through C1 leasing and enqueuing unsent rows until
    /// `countPending == 0` or the link drops, then reschedules itself if
    /// work remains (§4.4 item 5).
    pub(super) async fn run_pending_scan(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let batch = match self.ledger.get_pending_batch(PENDING_SCAN_BATCH_SIZE).await {
                Ok(batch) => batch,
                Err(err) => {
                    log::error!("pending scan failed to read a batch: {err}");
                    break;
                }
            };

            if batch.is_empty() {
                break;
            }

            for row in &batch {
                match self.ledger.mark_processing(row.id).await {
                    Ok(Some(_)) => self.enqueue_sync(row.id),
                    Ok(None) => {}
                    Err(err) => log::error!("pending scan failed to lease {}: {err}", row.id),
                }
            }

            if !self.broker.is_connected() {
                break;
            }
        }

        *self.pending_scan_running.lock().unwrap() = false;

        let remaining = self.ledger.count_pending().await.unwrap_or(0);
        if remaining > 0 {
            let worker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(PENDING_SCAN_RETRY_DELAY).await;
                worker.trigger_pending_scan();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    use crate::broker::FakeBrokerClient;
    use crate::ledger::SqliteLedger;
    use crate::queue::PublishQueue;

    async fn queue_with_fake_broker(connected: bool) -> (Arc<PublishQueue>, Arc<FakeBrokerClient>) {
        let ledger = Arc::new(SqliteLedger::open_in_memory().await.unwrap());
        let broker = Arc::new(FakeBrokerClient::new(connected));
        let queue = PublishQueue::new(
            ledger,
            broker.clone(),
            "jarvist".to_string(),
            "test-agent".to_string(),
            CancellationToken::new(),
        );
        (queue, broker)
    }

    #[tokio::test]
    async fn send_persists_before_any_publish_is_attempted() {
        let (queue, broker) = queue_with_fake_broker(false).await;
        let id = queue.send("jarvist/data/20240115", b"payload").await.unwrap();

        assert!(queue.ledger().get_pending(id).await.unwrap().is_some());
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn message_worker_publishes_and_marks_sent_once_connected() {
        let (queue, broker) = queue_with_fake_broker(true).await;
        queue.spawn_workers();

        let id = queue.send("jarvist/data/20240115", b"payload").await.unwrap();

        for _ in 0..50 {
            if let Some(row) = queue.ledger().get_pending(id).await.unwrap() {
                if row.sent {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let row = queue.ledger().get_pending(id).await.unwrap().unwrap();
        assert!(row.sent, "message should have been published and marked sent");
        assert_eq!(broker.published().len(), 1);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn full_main_channel_spills_into_overflow() {
        let (queue, _broker) = queue_with_fake_broker(false).await;
        // Don't spawn workers: keep `main` un-drained so capacity fills.
        for i in 0..crate::constants::MAIN_CHANNEL_CAPACITY + 5 {
            queue
                .send("jarvist/data/20240115", format!("{i}").as_bytes())
                .await
                .unwrap();
        }
        assert!(queue.overflow_len() > 0);
    }
}
