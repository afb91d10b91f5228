//! MQTT-backed `BrokerClient`.
//!
//! MQTT's QoS 1 gives at-least-once delivery natively, matching the
//! transport contract in §4.3/§6 directly; `rumqttc` supplies the client
//! and the event loop that must be polled continuously for the connection
//! to make progress.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerClient, ConnectionState};
use crate::error::PublishError;

fn state_to_u8(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Disconnected => 0,
        ConnectionState::Connecting => 1,
        ConnectionState::Connected => 2,
    }
}

fn u8_to_state(raw: u8) -> ConnectionState {
    match raw {
        2 => ConnectionState::Connected,
        1 => ConnectionState::Connecting,
        _ => ConnectionState::Disconnected,
    }
}

/// MQTT transport for C3, backed by `rumqttc::AsyncClient`.
///
/// The event loop must be polled for anything — connects, acks,
/// disconnects — to happen; `new` spawns that poll loop as a background
/// task tied to `shutdown`, the way C4's workers are all tied to one
/// cancellation token (§5).
pub struct MqttBrokerClient {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    /// Raw §4.3 state machine, driven purely by transport events — never
    /// adjusted for `last_activity` staleness (that's the connection
    /// monitor's "effective" judgment, layered on top in `queue::status`).
    state: Arc<AtomicU8>,
    last_activity: Arc<Mutex<DateTime<Utc>>>,
    publish_timeout: Duration,
}

impl MqttBrokerClient {
    /// Construct a client and start polling its event loop in the
    /// background. `client_id`/`host`/`port` are mandatory per §6's
    /// "Client identity: configured `client_id`"; `credentials`, if
    /// present, is `(username, password)`.
    pub fn new(
        client_id: &str,
        host: &str,
        port: u16,
        credentials: Option<(String, String)>,
        publish_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some((username, password)) = credentials {
            options.set_credentials(username, password);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        let connected = Arc::new(AtomicBool::new(false));
        // The event loop starts attempting the initial connection the
        // moment it's polled for the first time, so the raw state begins
        // life as `Connecting`, not `Disconnected` (§4.3's state machine).
        let state = Arc::new(AtomicU8::new(state_to_u8(ConnectionState::Connecting)));
        let last_activity = Arc::new(Mutex::new(Utc::now()));

        let loop_connected = connected.clone();
        let loop_state = state.clone();
        let loop_activity = last_activity.clone();
        let loop_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let poll = tokio::select! {
                    _ = loop_shutdown.cancelled() => break,
                    poll = event_loop.poll() => poll,
                };

                match poll {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        loop_connected.store(true, Ordering::SeqCst);
                        loop_state.store(state_to_u8(ConnectionState::Connected), Ordering::SeqCst);
                        *loop_activity.lock().await = Utc::now();
                    }
                    Ok(Event::Incoming(Packet::PubAck(_) | Packet::PubComp(_))) => {
                        *loop_activity.lock().await = Utc::now();
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) | Err(_) => {
                        loop_connected.store(false, Ordering::SeqCst);
                        loop_state.store(state_to_u8(ConnectionState::Disconnected), Ordering::SeqCst);
                    }
                    Ok(_) => {}
                }
            }
        });

        Self {
            client,
            connected,
            state,
            last_activity,
            publish_timeout,
        }
    }

    async fn publish_inner(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }

        let outcome = tokio::time::timeout(
            self.publish_timeout,
            self.client.publish(topic, qos, false, payload),
        )
        .await;

        match outcome {
            Err(_) => Err(PublishError::Timeout(self.publish_timeout)),
            Ok(Err(e)) => Err(PublishError::Rejected(e.to_string())),
            Ok(Ok(())) => {
                *self.last_activity.lock().await = Utc::now();
                Ok(())
            }
        }
    }
}

#[async_trait]
impl BrokerClient for MqttBrokerClient {
    async fn connect(&self) {
        // rumqttc reconnects automatically as the event loop is polled;
        // this only moves the raw state machine out of `Disconnected` so
        // callers watching `connection_state()` see the attempt register.
        // A no-op once already `Connecting`/`Connected`.
        let _ = self.state.compare_exchange(
            state_to_u8(ConnectionState::Disconnected),
            state_to_u8(ConnectionState::Connecting),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.state
            .store(state_to_u8(ConnectionState::Disconnected), Ordering::SeqCst);
        let _ = self.client.disconnect().await;
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.publish_inner(topic, payload, QoS::AtLeastOnce).await
    }

    async fn publish_heartbeat(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.publish_inner(topic, payload, QoS::AtMostOnce).await
    }

    fn connection_state(&self) -> ConnectionState {
        u8_to_state(self.state.load(Ordering::SeqCst))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn last_activity(&self) -> DateTime<Utc> {
        // Best-effort snapshot: `try_lock` avoids making this sync getter
        // block on the async mutex; a monitor tick that misses this race
        // simply sees a slightly stale value and tries again next tick.
        self.last_activity
            .try_lock()
            .map(|guard| *guard)
            .unwrap_or_else(|_| Utc::now())
    }

    async fn ping(&self) -> Result<Duration, PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let start = Instant::now();
        self.publish_inner("$SYS/ping", b"", QoS::AtMostOnce).await?;
        Ok(start.elapsed())
    }
}
