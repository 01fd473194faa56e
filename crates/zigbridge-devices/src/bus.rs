//! Message Bus interface.
//!
//! The broker client is an external collaborator; the bridge talks to it
//! through [`MessageBus`]. [`MemoryBus`] is an in-process implementation that
//! records every publish, used by tests and by dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Result type for Message Bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Error type for Message Bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Message bus is disconnected")]
    Disconnected,
}

/// Inbound message delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Publish/subscribe transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Subscribe to the given filters. Inbound messages are delivered on the
    /// returned channel, which stays open until the bus disconnects.
    async fn subscribe(&self, filters: &[String]) -> BusResult<mpsc::Receiver<BusMessage>>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> BusResult<()>;

    async fn disconnect(&self) -> BusResult<()>;
}

/// A publish recorded by [`MemoryBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: serde_json::Value,
    pub retain: bool,
}

#[derive(Default)]
struct MemoryBusState {
    published: Vec<Published>,
    filters: Vec<String>,
    inbound: Option<mpsc::Sender<BusMessage>>,
    fail_publish: bool,
    disconnected: bool,
}

/// In-memory message bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<MemoryBusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an inbound message as if it came from the broker.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> BusResult<()> {
        let sender = self
            .state
            .lock()
            .inbound
            .clone()
            .ok_or(BusError::Disconnected)?;
        sender
            .send(BusMessage::new(topic, payload))
            .await
            .map_err(|_| BusError::Disconnected)
    }

    /// Make every following publish fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publish = fail;
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.state.lock().published.clear();
    }

    pub fn filters(&self) -> Vec<String> {
        self.state.lock().filters.clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe(&self, filters: &[String]) -> BusResult<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(256);
        let mut state = self.state.lock();
        state.filters.extend(filters.iter().cloned());
        state.inbound = Some(tx);
        state.disconnected = false;
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> BusResult<()> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(BusError::Disconnected);
        }
        if state.fail_publish {
            return Err(BusError::Publish(format!("rejected publish to {}", topic)));
        }
        let payload = serde_json::from_slice(&payload)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&payload).into_owned()));
        state.published.push(Published {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        let mut state = self.state.lock();
        state.disconnected = true;
        state.inbound = None;
        Ok(())
    }
}
