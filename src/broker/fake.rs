//! In-memory `BrokerClient` double for C4 worker tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::broker::{BrokerClient, ConnectionState};
use crate::error::PublishError;

/// A broker double whose connection state and publish outcome are
/// controlled directly by the test, instead of a live MQTT session.
pub struct FakeBrokerClient {
    connected: AtomicBool,
    reject_next: AtomicBool,
    last_activity: Mutex<DateTime<Utc>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    heartbeats: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeBrokerClient {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            reject_next: AtomicBool::new(false),
            last_activity: Mutex::new(Utc::now()),
            published: Mutex::new(Vec::new()),
            heartbeats: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn reject_next_publish(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn heartbeats(&self) -> Vec<(String, Vec<u8>)> {
        self.heartbeats.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerClient for FakeBrokerClient {
    async fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Err(PublishError::Rejected("forced test rejection".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        *self.last_activity.lock().unwrap() = Utc::now();
        Ok(())
    }

    async fn publish_heartbeat(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.heartbeats
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        *self.last_activity.lock().unwrap() = Utc::now();
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        // The double has no modeled "connecting" transition — tests flip
        // `set_connected` straight between the two steady states.
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().unwrap()
    }

    async fn ping(&self) -> Result<Duration, PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        Ok(Duration::from_millis(1))
    }
}
