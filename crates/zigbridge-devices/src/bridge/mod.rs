//! Bridge Core.
//!
//! Owns the bridge lifecycle: startup against the Device Network, the
//! inbound command pipeline (topic, payload, validation, dispatch, confirming
//! publish), publishing of adapter events, and an orderly shutdown.

pub mod payload;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zigbridge_core::{
    BridgeConfig, BridgeEvent, Capability, Error, EventBus, EventBusReceiver, Ieee,
    NormalizedEvent, Result, TimingConfig,
};

use crate::adapter::GatewayAdapter;
use crate::bus::{BusMessage, MessageBus};
use crate::dispatcher::{Command, CommandDispatcher, DispatchOutcome, DispatchStats, PermitJoinOutcome};
use crate::network::{DeviceNetwork, NetworkEvent, NetworkHandle, NetworkInfo};
use crate::refresher::PeriodicRefresher;
use crate::registry::RegistryView;
use crate::topics::{Route, TopicRouter};

pub use payload::PayloadError;

/// Everything the spawned loops need to publish and to handle commands.
struct Shared {
    bus: Arc<dyn MessageBus>,
    router: TopicRouter,
    dispatcher: CommandDispatcher,
    registry: RegistryView,
    network_info: RwLock<Option<NetworkInfo>>,
    permit_join_duration: Duration,
}

impl Shared {
    /// Publish a JSON document. Failures are logged, never raised.
    async fn publish(&self, route: &Route, payload: &Value, retain: bool) -> bool {
        let topic = self.router.topic(route);
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize payload for {}: {}", topic, e);
                return false;
            }
        };
        match self.bus.publish(&topic, bytes, retain).await {
            Ok(()) => {
                debug!("Published to {} (retain={})", topic, retain);
                true
            }
            Err(e) => {
                warn!("Failed to publish to {}: {}", topic, e);
                false
            }
        }
    }

    async fn publish_event(&self, event: BridgeEvent) {
        debug!("Publishing {} event for {}", event.type_name(), event.ieee());
        match event {
            BridgeEvent::Attribute(event) => {
                let route = Route::DeviceState {
                    ieee: event.ieee,
                    capability: event.capability,
                };
                self.publish(&route, &event.state_payload(), true).await;
            }
            BridgeEvent::DeviceJoined(announcement) => {
                self.publish(&Route::Joined, &payload::device_joined(&announcement), false)
                    .await;
                self.publish(
                    &Route::DeviceStatus {
                        ieee: announcement.ieee,
                    },
                    &payload::device_status(&announcement),
                    true,
                )
                .await;
            }
            BridgeEvent::DeviceLeft {
                ieee,
                nwk,
                timestamp,
            } => {
                self.publish(&Route::Left, &payload::device_left(ieee, nwk, timestamp), false)
                    .await;
            }
        }
    }

    async fn publish_coordinator_status(&self, status: &str) -> bool {
        let info = *self.network_info.read();
        let devices = match info {
            Some(_) => self.registry.list().await,
            None => Vec::new(),
        };
        let message = payload::coordinator_status(status, info.as_ref(), &devices, Utc::now());
        self.publish(&Route::CoordinatorStatus, &message, true).await
    }

    async fn handle_message(&self, message: BusMessage) -> Option<DispatchOutcome> {
        let route = match self.router.parse(&message.topic) {
            Ok(route) => route,
            Err(e) => {
                debug!("Ignoring message on {}: {}", message.topic, e);
                return None;
            }
        };
        match route {
            Route::DeviceSet { ieee, capability } => {
                self.handle_set(ieee, capability, &message.payload).await
            }
            Route::PermitJoin => {
                self.handle_permit_join(&message.payload).await;
                None
            }
            other => {
                debug!(
                    "Ignoring message on {} ({} topic)",
                    message.topic,
                    other.direction()
                );
                None
            }
        }
    }

    /// Malformed payloads are dropped before dispatch and yield `None`.
    async fn handle_set(
        &self,
        ieee: Ieee,
        capability: Capability,
        body: &[u8],
    ) -> Option<DispatchOutcome> {
        let operation = match payload::parse_command(capability, body) {
            Ok(operation) => operation,
            Err(e) => {
                warn!("Dropping {} command for device {}: {}", capability, ieee, e);
                return None;
            }
        };

        let command = Command::new(ieee, capability, operation);
        let outcome = self.dispatcher.dispatch(&command).await;
        match &outcome {
            DispatchOutcome::Success {
                command: sent,
                value,
                attempts,
                ..
            } => {
                info!(
                    "Sent {} to device {} [{}] after {} attempt(s)",
                    sent.name(),
                    ieee,
                    command.correlation_id,
                    attempts
                );
                let event =
                    NormalizedEvent::new(ieee, capability, command.operation.name(), value.clone());
                self.publish(
                    &Route::DeviceState { ieee, capability },
                    &event.state_payload(),
                    true,
                )
                .await;
            }
            DispatchOutcome::NotFound => {
                warn!(
                    "Device {} not found, dropping {} command [{}]",
                    ieee, capability, command.correlation_id
                );
            }
            DispatchOutcome::Unavailable => {
                warn!(
                    "Device {} unavailable, dropping {} command [{}]",
                    ieee, capability, command.correlation_id
                );
            }
            DispatchOutcome::Unsupported => {
                warn!(
                    "Device {} does not support {} [{}]",
                    ieee, capability, command.correlation_id
                );
            }
            DispatchOutcome::TimeoutAfterRetries { attempts } => {
                error!(
                    "Failed to send {} command to device {} [{}]: timed out after {} attempts",
                    capability, ieee, command.correlation_id, attempts
                );
            }
            DispatchOutcome::Failed(reason) => {
                error!(
                    "Failed to send {} command to device {} [{}]: {}",
                    capability, ieee, command.correlation_id, reason
                );
            }
        }
        Some(outcome)
    }

    async fn handle_permit_join(&self, body: &[u8]) {
        let enable = match payload::parse_permit_join(body) {
            Ok(enable) => enable,
            Err(e) => {
                warn!("Dropping permit join request: {}", e);
                return;
            }
        };
        let duration = if enable {
            self.permit_join_duration
        } else {
            Duration::ZERO
        };

        match self.dispatcher.permit_join(duration).await {
            PermitJoinOutcome::Applied { .. } => {
                let status = payload::permit_join_status(duration.as_secs(), Utc::now());
                self.publish(&Route::PermitJoinStatus, &status, true).await;
            }
            PermitJoinOutcome::TimeoutAfterRetries { attempts } => {
                error!("Failed to set permit join: timed out after {} attempts", attempts);
            }
            PermitJoinOutcome::Failed(reason) => {
                error!("Failed to set permit join: {}", reason);
            }
        }
    }
}

/// The Zigbee to message bus bridge.
pub struct Bridge {
    shared: Arc<Shared>,
    network: NetworkHandle,
    adapter: Arc<GatewayAdapter>,
    refresher: Arc<PeriodicRefresher>,
    timing: TimingConfig,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    fatal_tx: mpsc::Sender<Error>,
    fatal_rx: Mutex<Option<mpsc::Receiver<Error>>>,
    /// Set once `online` has been announced.
    started: AtomicBool,
}

impl Bridge {
    pub fn new(config: &BridgeConfig, bus: Arc<dyn MessageBus>) -> Self {
        let timing = config.timing.clone();
        let network = NetworkHandle::new();
        let adapter = Arc::new(GatewayAdapter::new(
            network.clone(),
            EventBus::with_name("bridge"),
            &timing,
        ));
        let registry = adapter.registry();
        let dispatcher = CommandDispatcher::new(registry.clone(), network.clone(), &timing);
        let refresher = Arc::new(PeriodicRefresher::new(
            registry.clone(),
            network.clone(),
            &timing,
        ));
        let (shutdown_tx, _) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::channel(4);

        Self {
            shared: Arc::new(Shared {
                bus,
                router: TopicRouter::new(config.mqtt.base_topic.as_str()),
                dispatcher,
                registry,
                network_info: RwLock::new(None),
                permit_join_duration: timing.permit_join_duration(),
            }),
            network,
            adapter,
            refresher,
            timing,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            started: AtomicBool::new(false),
        }
    }

    pub fn router(&self) -> &TopicRouter {
        &self.shared.router
    }

    pub fn registry(&self) -> RegistryView {
        self.shared.registry.clone()
    }

    pub fn network(&self) -> &NetworkHandle {
        &self.network
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.shared.dispatcher.stats()
    }

    pub fn network_info(&self) -> Option<NetworkInfo> {
        *self.shared.network_info.read()
    }

    /// Receiver for errors that must take the process down. Can be taken once.
    pub fn take_fatal_receiver(&self) -> Option<mpsc::Receiver<Error>> {
        self.fatal_rx.lock().take()
    }

    /// Subscribe to the bus, bring the Device Network up and start all loops.
    ///
    /// A startup timeout is returned as [`Error::StartupTimeout`] without
    /// further attempts. On failure an `offline` status is published.
    pub async fn start(&self, network: Arc<dyn DeviceNetwork>) -> Result<NetworkInfo> {
        let router = &self.shared.router;
        let inbound = self
            .shared
            .bus
            .subscribe(&router.subscriptions())
            .await
            .map_err(|e| Error::bus(e.to_string()))?;
        info!("Subscribed to {} command topics", router.subscriptions().len());

        let info = match self.initialize_network(network.as_ref()).await {
            Ok(info) => info,
            Err(e) => {
                error!("Device network startup failed: {}", e);
                self.shared.publish_coordinator_status("offline").await;
                return Err(e);
            }
        };
        info!(
            "Device network up: channel {}, PAN 0x{:04x}, extended PAN {}",
            info.channel, info.pan_id, info.extended_pan_id
        );
        *self.shared.network_info.write() = Some(info);

        // Subscribe before anything can emit, so no event is missed.
        let network_events = network.subscribe();
        let bridge_events = self.adapter.event_bus().subscribe();
        self.network.update(network);

        if let Err(e) = self.adapter.sync_devices().await {
            warn!("Failed to load known devices: {}", e);
        }

        let shutdown = self.shutdown_tx.subscribe();
        let mut tasks = Vec::new();
        tasks.push(self.supervise_adapter(network_events, shutdown.clone()));
        tasks.push(self.spawn_event_publisher(bridge_events, shutdown.clone()));
        tasks.push(self.spawn_inbound(inbound, shutdown.clone()));
        tasks.push(self.refresher.clone().spawn(shutdown));
        self.tasks.lock().extend(tasks);

        self.started.store(true, Ordering::SeqCst);
        self.shared.publish_coordinator_status("online").await;
        info!("Bridge started");
        Ok(info)
    }

    async fn initialize_network(&self, network: &dyn DeviceNetwork) -> Result<NetworkInfo> {
        let attempts = self.timing.startup_attempts.max(1);
        let timeout = self.timing.startup_timeout();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(timeout, network.initialize()).await {
                Ok(Ok(info)) => return Ok(info),
                Err(_) => return Err(Error::StartupTimeout(timeout)),
                Ok(Err(e)) if attempt < attempts => {
                    warn!(
                        "Device network initialisation failed, attempt {} of {}: {}",
                        attempt, attempts, e
                    );
                    tokio::time::sleep(self.timing.startup_retry_delay()).await;
                }
                Ok(Err(e)) => {
                    return Err(Error::network(format!(
                        "initialisation failed after {} attempts: {}",
                        attempts, e
                    )))
                }
            }
        }
    }

    /// Run the adapter and report a fatal error if its event stream ends
    /// while the bridge is still running.
    fn supervise_adapter(
        &self,
        events: broadcast::Receiver<NetworkEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let adapter = self.adapter.clone().spawn(events, shutdown.clone());
        let fatal = self.fatal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.await {
                error!("Gateway adapter task failed: {}", e);
            }
            if !*shutdown.borrow() {
                let _ = fatal
                    .send(Error::network("device network event stream closed"))
                    .await;
            }
        })
    }

    fn spawn_event_publisher(
        &self,
        mut events: EventBusReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Some(event) => shared.publish_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("Event publisher stopped");
        })
    }

    /// Each inbound message is handled on its own task.
    fn spawn_inbound(
        &self,
        mut inbound: mpsc::Receiver<BusMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let fatal = self.fatal_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    message = inbound.recv() => match message {
                        Some(message) => {
                            let shared = shared.clone();
                            tokio::spawn(async move {
                                shared.handle_message(message).await;
                            });
                        }
                        None => {
                            if !*shutdown.borrow() {
                                let _ = fatal.send(Error::bus("inbound message stream closed")).await;
                            }
                            break;
                        }
                    },
                }
            }
            debug!("Inbound message loop stopped");
        })
    }

    /// Handle one inbound bus message to completion.
    ///
    /// Returns the dispatch outcome for well-formed device commands.
    pub async fn handle_message(&self, message: BusMessage) -> Option<DispatchOutcome> {
        self.shared.handle_message(message).await
    }

    /// Publish one adapter event to the bus.
    pub async fn publish_event(&self, event: BridgeEvent) {
        self.shared.publish_event(event).await
    }

    /// Topic a device capability's state is published on.
    pub fn state_topic(&self, ieee: Ieee, capability: Capability) -> String {
        self.shared
            .router
            .topic(&Route::DeviceState { ieee, capability })
    }

    /// Stop the bridge. Every step runs even if an earlier one fails.
    pub async fn shutdown(&self) {
        info!("Shutting down bridge");
        let limit = self.timing.shutdown_timeout();

        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(limit, &mut task).await.is_err() {
                warn!("Background task did not stop within {:?}, aborting", limit);
                task.abort();
            }
        }
        debug!("Periodic refresher and event loops stopped");

        // A failed start has already announced `offline`.
        if self.started.swap(false, Ordering::SeqCst) {
            let offline = self.shared.publish_coordinator_status("offline");
            match tokio::time::timeout(limit, offline).await {
                Ok(true) => {}
                Ok(false) => warn!("Could not publish offline status"),
                Err(_) => warn!("Publishing offline status timed out"),
            }
        }

        match tokio::time::timeout(limit, self.shared.bus.disconnect()).await {
            Ok(Ok(())) => debug!("Message bus disconnected"),
            Ok(Err(e)) => warn!("Error disconnecting message bus: {}", e),
            Err(_) => warn!("Message bus disconnect timed out"),
        }

        if let Some(network) = self.network.release() {
            match tokio::time::timeout(limit, network.shutdown()).await {
                Ok(Ok(())) => debug!("Device network released"),
                Ok(Err(e)) => warn!("Error releasing device network: {}", e),
                Err(_) => warn!("Device network release timed out"),
            }
        }
        info!("Bridge stopped");
    }
}
