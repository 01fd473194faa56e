//! In-process event bus between the Gateway Adapter and the Bridge Core.
//!
//! The adapter publishes [`BridgeEvent`]s; the bridge (and tests) subscribe.
//! Events are distributed over a tokio broadcast channel, so a subscriber that
//! falls too far behind loses the oldest events rather than blocking the
//! adapter.

use crate::event::BridgeEvent;
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Event bus for bridge events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
    name: String,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            name: "default".to_string(),
        }
    }

    /// Create a new event bus with a name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            tx: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            name: name.into(),
        }
    }

    /// Publish an event.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub async fn publish(&self, event: BridgeEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
            bus: self.name.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<BridgeEvent>,
    bus: String,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` once every sender is gone. Lagging is logged and
    /// skipped over.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event bus '{}' subscriber lagged, {} events dropped", self.bus, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AttributeValue, NormalizedEvent, OnOffState};
    use crate::types::{Capability, Ieee};

    fn attribute(ieee: Ieee) -> BridgeEvent {
        BridgeEvent::Attribute(NormalizedEvent::new(
            ieee,
            Capability::Switch,
            "on_off",
            AttributeValue::OnOff(OnOffState::On),
        ))
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert!(bus.publish(attribute(Ieee::from_u64(1))).await);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.type_name(), "attribute");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::with_name("adapter");
        assert!(!bus.publish(attribute(Ieee::from_u64(1))).await);

        let mut rx = bus.subscribe();
        assert!(bus.publish(attribute(Ieee::from_u64(1))).await);
        assert!(rx.try_recv().is_some());
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(attribute(Ieee::from_u64(7))).await;

        assert_eq!(rx1.recv().await.unwrap().ieee(), Ieee::from_u64(7));
        assert_eq!(rx2.recv().await.unwrap().ieee(), Ieee::from_u64(7));
    }

    #[tokio::test]
    async fn test_lagged_receiver_keeps_going() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(attribute(Ieee::from_u64(i))).await;
        }

        // The two newest events survive.
        assert_eq!(rx.recv().await.unwrap().ieee(), Ieee::from_u64(3));
        assert_eq!(rx.recv().await.unwrap().ieee(), Ieee::from_u64(4));
    }
}
