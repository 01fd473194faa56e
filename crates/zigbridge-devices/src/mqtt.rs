//! MQTT implementation of the Message Bus.
//!
//! Wraps a rumqttc `AsyncClient`. The event loop runs in its own task; it
//! re-subscribes on every ConnAck (so subscriptions survive broker restarts)
//! and forwards inbound publishes to the bridge.

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zigbridge_core::MqttConfig;

use crate::bus::{BusError, BusMessage, BusResult, MessageBus};

/// Consecutive event-loop errors before the failure is escalated.
const MAX_ERRORS: u32 = 5;

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

struct Shared {
    filters: Mutex<Vec<String>>,
    inbound: Mutex<Option<mpsc::Sender<BusMessage>>>,
    running: AtomicBool,
}

/// Message Bus backed by an MQTT broker.
pub struct MqttBus {
    client: AsyncClient,
    qos: QoS,
    broker_addr: String,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Create the client and start its event loop.
    ///
    /// The connection itself is established asynchronously by the event loop.
    pub fn connect(config: &MqttConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("zigbridge-{}", Uuid::new_v4()));
        let mut options = MqttOptions::new(&client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let shared = Arc::new(Shared {
            filters: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
            running: AtomicBool::new(true),
        });
        let qos = qos_from(config.qos);
        let broker_addr = config.full_broker_addr();

        let task = tokio::spawn(Self::run_event_loop(
            eventloop,
            client.clone(),
            qos,
            shared.clone(),
            broker_addr.clone(),
        ));

        info!("MQTT client {} connecting to {}", client_id, broker_addr);
        Self {
            client,
            qos,
            broker_addr,
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn broker_addr(&self) -> &str {
        &self.broker_addr
    }

    async fn run_event_loop(
        mut eventloop: rumqttc::EventLoop,
        client: AsyncClient,
        qos: QoS,
        shared: Arc<Shared>,
        broker_addr: String,
    ) {
        let mut error_count = 0;

        while shared.running.load(Ordering::SeqCst) {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    error_count = 0;
                    info!("MQTT broker {} connection acknowledged", broker_addr);
                    let filters = shared.filters.lock().clone();
                    for filter in filters {
                        // try_subscribe: the event loop itself drains the request queue.
                        if let Err(e) = client.try_subscribe(filter.as_str(), qos) {
                            warn!("Failed to subscribe to {}: {}", filter, e);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    error_count = 0;
                    debug!(
                        "Received MQTT message on topic: {}, payload length: {}",
                        publish.topic,
                        publish.payload.len()
                    );
                    let sender = shared.inbound.lock().clone();
                    if let Some(sender) = sender {
                        let message = BusMessage::new(publish.topic.clone(), publish.payload.to_vec());
                        if sender.send(message).await.is_err() {
                            debug!("Inbound receiver dropped, discarding message");
                        }
                    }
                }
                Ok(_) => {
                    error_count = 0;
                }
                Err(e) => {
                    if !shared.running.load(Ordering::SeqCst) {
                        break;
                    }
                    error_count += 1;
                    if error_count == MAX_ERRORS {
                        error!(
                            "MQTT broker {} error count reached {}: {}",
                            broker_addr, MAX_ERRORS, e
                        );
                    } else {
                        warn!(
                            "MQTT broker {} error ({}/{}): {}",
                            broker_addr, error_count, MAX_ERRORS, e
                        );
                    }
                    let backoff = if error_count >= MAX_ERRORS { 5 } else { 1 };
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
            }
        }

        shared.inbound.lock().take();
        info!("MQTT broker {} connection closed", broker_addr);
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn subscribe(&self, filters: &[String]) -> BusResult<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(256);
        *self.shared.inbound.lock() = Some(tx);
        self.shared.filters.lock().extend(filters.iter().cloned());

        for filter in filters {
            self.client
                .subscribe(filter.as_str(), self.qos)
                .await
                .map_err(|e| BusError::Subscribe(format!("{}: {}", filter, e)))?;
        }
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> BusResult<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        // The request queue is bounded and only drains while connected.
        self.client
            .try_publish(topic, self.qos, retain, payload)
            .map_err(|e| BusError::Publish(format!("{}: {}", topic, e)))
    }

    async fn disconnect(&self) -> BusResult<()> {
        let result = self
            .client
            .try_disconnect()
            .map_err(|e| BusError::Connection(e.to_string()));
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.inbound.lock().take();

        let task = self.task.lock().take();
        if let Some(task) = task {
            // Give the event loop a moment to flush the disconnect.
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                debug!("MQTT event loop did not stop in time");
            }
        }
        result
    }
}
