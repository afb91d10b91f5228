//! Publish queue (C4) — the hardest subsystem (§4.4).
//!
//! Guarantees that every message accepted via [`PublishQueue::send`] is
//! eventually either delivered to the broker and marked sent in the
//! ledger, or retained there for a later attempt.

mod status;
mod workers;

pub use status::QueueStatus;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerClient;
use crate::constants::{MAIN_CHANNEL_CAPACITY, WORKER_JOIN_BUDGET, WORKER_SEMAPHORE_CAPACITY};
use crate::error::LedgerError;
use crate::ledger::Repository;

/// The durable publish queue sitting between C5's ingest pipeline and C3's
/// broker client.
///
/// `main` is the bounded channel; `overflow` is the unbounded tail that
/// absorbs bursts past `main`'s capacity — disk (via the ledger row each
/// id refers to) is the real upper bound, not `overflow` itself (§4.4
/// "Backpressure").
pub struct PublishQueue {
    ledger: Arc<dyn Repository>,
    broker: Arc<dyn BrokerClient>,
    main_tx: mpsc::Sender<i64>,
    main_rx: Mutex<Option<mpsc::Receiver<i64>>>,
    overflow: Mutex<VecDeque<i64>>,
    worker_sem: Arc<Semaphore>,
    pending_scan_running: Mutex<bool>,
    shutdown: CancellationToken,
    base_topic: String,
    client_id: String,
    started_at: Instant,
    processed_count: AtomicI64,
    overflow_high_water: AtomicI64,
    shutting_down: AtomicBool,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PublishQueue {
    /// Build a queue. `base_topic` is the `<base>` in `<base>/heartbeat`,
    /// `<base>/summary/folders` and `<base>/test` (§6); `client_id`
    /// identifies this agent in heartbeat payloads.
    pub fn new(
        ledger: Arc<dyn Repository>,
        broker: Arc<dyn BrokerClient>,
        base_topic: String,
        client_id: String,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (main_tx, main_rx) = mpsc::channel(MAIN_CHANNEL_CAPACITY);

        Arc::new(Self {
            ledger,
            broker,
            main_tx,
            main_rx: Mutex::new(Some(main_rx)),
            overflow: Mutex::new(VecDeque::new()),
            worker_sem: Arc::new(Semaphore::new(WORKER_SEMAPHORE_CAPACITY)),
            pending_scan_running: Mutex::new(false),
            shutdown,
            base_topic,
            client_id,
            started_at: Instant::now(),
            processed_count: AtomicI64::new(0),
            overflow_high_water: AtomicI64::new(0),
            shutting_down: AtomicBool::new(false),
            worker_handles: Mutex::new(Vec::new()),
        })
    }

    /// Start the five long-running workers (§4.4). Call once, after
    /// construction; running it twice would steal `main_rx` out from
    /// under the first call's message worker.
    pub fn spawn_workers(self: &Arc<Self>) {
        let mut handles = Vec::with_capacity(5);
        handles.push(tokio::spawn(self.clone().message_worker()));
        handles.push(tokio::spawn(self.clone().overflow_drain_worker()));
        handles.push(tokio::spawn(self.clone().connection_monitor()));
        handles.push(tokio::spawn(self.clone().heartbeat_worker()));
        *self.worker_handles.lock().unwrap() = handles;

        // Recover leases stranded by a prior crash (I2) and pick up any
        // rows left over from the previous run.
        self.trigger_pending_scan();
    }

    /// Enqueue `(topic, payload)` for durable delivery (§4.4 "Enqueue
    /// semantics"). Never blocks beyond the ledger round-trip (I5).
    pub async fn send(&self, topic: &str, payload: &[u8]) -> Result<i64, LedgerError> {
        let id = self
            .ledger
            .insert_pending(topic, payload, self.broker.is_connected())
            .await?;

        // The row was just inserted unsent and unleased, so this lease
        // acquisition cannot lose a race with anything but a full restart.
        self.ledger.mark_processing(id).await?;

        self.enqueue_sync(id);
        Ok(id)
    }

    /// Publish a one-off diagnostic message outside the durable path
    /// (backs `sendTestMessage`, §6) — bypasses the ledger entirely since
    /// it carries no delivery guarantee.
    pub async fn send_test_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), crate::error::PublishError> {
        self.broker.publish(topic, payload).await
    }

    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn broker(&self) -> &Arc<dyn BrokerClient> {
        &self.broker
    }

    pub fn ledger(&self) -> &Arc<dyn Repository> {
        &self.ledger
    }

    /// Force a pending-message scan on demand (backs `forcePendingScan`).
    pub fn trigger_pending_scan(self: &Arc<Self>) {
        {
            let mut running = self.pending_scan_running.lock().unwrap();
            if *running {
                return;
            }
            *running = true;
        }
        let worker = self.clone();
        tokio::spawn(async move { worker.run_pending_scan().await });
    }

    /// Non-blocking two-tier enqueue used by both `send` and worker
    /// requeues on publish failure.
    fn enqueue_sync(&self, id: i64) {
        match self.main_tx.try_send(id) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(id)) => {
                let mut overflow = self.overflow.lock().unwrap();
                overflow.push_back(id);
                let len = overflow.len() as i64;
                drop(overflow);
                self.overflow_high_water.fetch_max(len, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Only happens once every receiver has been dropped, i.e.
                // after shutdown has already torn down the workers.
            }
        }
    }

    fn overflow_len(&self) -> usize {
        self.overflow.lock().unwrap().len()
    }

    /// Snapshot for the `status` control operation (§6).
    pub async fn status(&self) -> QueueStatus {
        status::build(self).await
    }

    /// Shutdown sequence (§4.4 "Shutdown"): cancel, best-effort drain,
    /// close the broker session, wait for workers to exit.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.cancel();

        if self.broker.is_connected() {
            self.trigger_pending_scan();
        }

        let handles = std::mem::take(&mut *self.worker_handles.lock().unwrap());
        let deadline = tokio::time::Instant::now() + WORKER_JOIN_BUDGET;
        for handle in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                log::warn!("publish queue worker did not exit within the shutdown budget");
            }
        }

        self.broker.disconnect().await;
    }
}
