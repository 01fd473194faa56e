//! Gateway Adapter.
//!
//! Consumes Device Network events, keeps the [`DeviceRegistry`] up to date
//! (it is the registry's only writer) and publishes normalized
//! [`BridgeEvent`]s on the event bus. Nothing raised by the Device Network
//! propagates past this type: failures are logged with device context.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zigbridge_core::{
    BridgeEvent, Capability, ClusterKind, DeviceAnnouncement, EndpointDescriptor, EventBus, Ieee,
    NormalizedEvent, Nwk, TimingConfig,
};

use crate::codec::{cluster_spec, RawValue};
use crate::network::{DeviceInfo, NetworkError, NetworkEvent, NetworkHandle};
use crate::registry::{DeviceRecord, DeviceRegistry, RegistryView};

/// Bridges Device Network activity into the registry and the event bus.
pub struct GatewayAdapter {
    registry: Arc<DeviceRegistry>,
    network: NetworkHandle,
    events: EventBus,
    /// Leave count per device. Held while a join registers or a leave
    /// removes, so a join overtaken by a leave never registers the device.
    leaves: Mutex<HashMap<Ieee, u64>>,
    join_poll_attempts: u32,
    join_poll_backoff: Duration,
}

impl GatewayAdapter {
    pub fn new(network: NetworkHandle, events: EventBus, timing: &TimingConfig) -> Self {
        Self {
            registry: Arc::new(DeviceRegistry::new()),
            network,
            events,
            leaves: Mutex::new(HashMap::new()),
            join_poll_attempts: timing.join_poll_attempts.max(1),
            join_poll_backoff: timing.join_poll_backoff(),
        }
    }

    /// Read-only view of the registry for other components.
    pub fn registry(&self) -> RegistryView {
        RegistryView::new(self.registry.clone())
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Load the devices the network already knows and bridge them.
    ///
    /// No `device_joined` events are published for them.
    pub async fn sync_devices(&self) -> Result<usize, NetworkError> {
        let network = self.network.current()?;
        let devices = network.devices().await?;
        let count = devices.len();
        for info in devices {
            self.registry.upsert_device(&info).await;
            if !info.is_coordinator {
                self.bridge_device(&info.ieee).await;
            }
        }
        info!("Loaded {} devices from the device network", count);
        Ok(count)
    }

    /// Run the event loop until shutdown is signalled or the network goes away.
    ///
    /// Joins are handled on their own tasks, since waiting for endpoint
    /// enumeration must not hold up events for other devices.
    pub fn spawn(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<NetworkEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = rx.recv() => match event {
                        Ok(NetworkEvent::DeviceJoined { ieee, nwk }) => {
                            let adapter = self.clone();
                            tokio::spawn(async move { adapter.on_joined(ieee, nwk).await });
                        }
                        Ok(event) => self.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Gateway adapter lagged, {} network events dropped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Gateway adapter stopped");
        })
    }

    /// Handle one network event to completion.
    pub async fn handle_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::DeviceJoined { ieee, nwk } => self.on_joined(ieee, nwk).await,
            NetworkEvent::DeviceLeft { ieee, nwk } => self.on_left(ieee, nwk).await,
            NetworkEvent::EndpointsEnumerated { ieee, endpoints } => {
                self.on_endpoints(ieee, &endpoints).await
            }
            NetworkEvent::AttributeUpdated {
                ieee,
                endpoint,
                cluster_id,
                attribute,
                value,
            } => {
                self.on_attribute(ieee, endpoint, cluster_id, &attribute, value)
                    .await
            }
            NetworkEvent::AvailabilityChanged { ieee, available } => {
                self.on_availability(ieee, available).await
            }
        }
    }

    async fn on_joined(&self, ieee: Ieee, nwk: Nwk) {
        info!("Device joined: {} ({})", ieee, nwk);
        let seen = self.leaves.lock().await.get(&ieee).copied().unwrap_or(0);

        let info = match self.await_endpoints(ieee, nwk).await {
            Some(info) => info,
            None => return,
        };
        if info.endpoints.is_empty() {
            warn!(
                "Device {} reported no endpoints after {} polls, bridging what is known",
                ieee, self.join_poll_attempts
            );
        }

        {
            let leaves = self.leaves.lock().await;
            if leaves.get(&ieee).copied().unwrap_or(0) != seen {
                debug!("Device {} left while joining, dropping the join", ieee);
                return;
            }
            self.registry.upsert_device(&info).await;
        }
        let bound = self.bridge_device(&ieee).await;
        debug!("Device {}: {} clusters newly bound", ieee, bound);

        if let Some(record) = self.registry.lookup_by_address(&ieee).await {
            self.events
                .publish(BridgeEvent::DeviceJoined(announcement(&record)))
                .await;
        }
    }

    /// Poll the network until the device's endpoints are enumerated.
    ///
    /// Returns `None` if the device vanished in the meantime.
    async fn await_endpoints(&self, ieee: Ieee, nwk: Nwk) -> Option<DeviceInfo> {
        let mut last = None;
        for attempt in 1..=self.join_poll_attempts {
            let network = match self.network.current() {
                Ok(network) => network,
                Err(e) => {
                    warn!("Cannot query joined device {}: {}", ieee, e);
                    return None;
                }
            };
            match network.device(&ieee).await {
                Ok(info) if !info.endpoints.is_empty() => return Some(info),
                Ok(info) => last = Some(info),
                Err(NetworkError::DeviceNotFound(_)) => {
                    debug!("Device {} left before enumeration finished", ieee);
                    return None;
                }
                Err(e) => warn!("Device {}: endpoint poll {} failed: {}", ieee, attempt, e),
            }
            if attempt < self.join_poll_attempts {
                tokio::time::sleep(self.join_poll_backoff).await;
            }
        }
        Some(last.unwrap_or_else(|| DeviceInfo::new(ieee, nwk)))
    }

    async fn on_left(&self, ieee: Ieee, nwk: Nwk) {
        info!("Device left: {} ({})", ieee, nwk);
        self.events
            .publish(BridgeEvent::DeviceLeft {
                ieee,
                nwk,
                timestamp: Utc::now(),
            })
            .await;
        let mut leaves = self.leaves.lock().await;
        *leaves.entry(ieee).or_insert(0) += 1;
        if self.registry.remove_device(&ieee).await.is_none() {
            debug!("Device {} was not registered", ieee);
        }
    }

    async fn on_endpoints(&self, ieee: Ieee, endpoints: &[EndpointDescriptor]) {
        match self.registry.set_endpoints(&ieee, endpoints).await {
            Ok(true) => {
                debug!("Device {}: endpoint set changed", ieee);
                self.bridge_device(&ieee).await;
            }
            Ok(false) => {}
            Err(e) => debug!("Ignoring endpoint enumeration: {}", e),
        }
    }

    async fn on_availability(&self, ieee: Ieee, available: bool) {
        match self.registry.set_availability(&ieee, available).await {
            Ok(true) if available => {
                info!("Device {} available again", ieee);
                self.bridge_device(&ieee).await;
            }
            Ok(true) => info!("Device {} unavailable, bindings dropped", ieee),
            Ok(false) => {}
            Err(e) => debug!("Ignoring availability change: {}", e),
        }
    }

    async fn on_attribute(
        &self,
        ieee: Ieee,
        endpoint: u8,
        cluster_id: u16,
        attribute: &str,
        raw: RawValue,
    ) {
        let Some(kind) = ClusterKind::from_id(cluster_id) else {
            debug!("Device {}: ignoring cluster 0x{:04x}", ieee, cluster_id);
            return;
        };
        let Some(record) = self.registry.lookup_by_address(&ieee).await else {
            debug!("Attribute update from unknown device {}", ieee);
            return;
        };
        if !record.is_bound(endpoint, kind) {
            debug!("Device {}: {} on endpoint {} is not bound", ieee, kind, endpoint);
            return;
        }

        let spec = cluster_spec(kind);
        let value = match spec.decode(attribute, raw) {
            Ok(value) => value,
            Err(e) if e.is_unknown_attribute() => {
                debug!("Device {}: {}", ieee, e);
                return;
            }
            Err(e) => {
                warn!("Device {}: dropping {} report: {}", ieee, kind, e);
                return;
            }
        };

        let mut capabilities = vec![spec.capability];
        if kind == ClusterKind::OnOff && record.has_capability(Capability::Light) {
            capabilities.push(Capability::Light);
        }
        for capability in capabilities {
            let event = NormalizedEvent::new(ieee, capability, attribute, value.clone());
            self.events.publish(BridgeEvent::Attribute(event)).await;
        }
    }

    /// Bind every supported cluster on every bridgeable endpoint, configuring
    /// reporting once per new binding. Returns the number of new bindings.
    async fn bridge_device(&self, ieee: &Ieee) -> usize {
        let Some(record) = self.registry.lookup_by_address(ieee).await else {
            return 0;
        };
        if !record.available {
            warn!("Device {} is not available, skipping cluster setup", ieee);
            return 0;
        }

        let mut bound = 0;
        for binding in record.bindable_clusters() {
            match self
                .registry
                .bind_cluster(ieee, binding.endpoint, binding.cluster)
                .await
            {
                Ok(true) => {
                    bound += 1;
                    self.configure_reporting(ieee, binding.endpoint, binding.cluster)
                        .await;
                }
                Ok(false) => {}
                Err(e) => warn!("Device {}: cannot bind {}: {}", ieee, binding.cluster, e),
            }
        }
        bound
    }

    async fn configure_reporting(&self, ieee: &Ieee, endpoint: u8, cluster: ClusterKind) {
        let result = match self.network.current() {
            Ok(network) => {
                network
                    .configure_reporting(ieee, endpoint, cluster.id(), cluster_spec(cluster).reporting)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(
                "Device {}: reporting setup for {} on endpoint {} failed: {}",
                ieee, cluster, endpoint, e
            );
        }
    }
}

/// Snapshot of a registered device for the `device_joined` event.
pub fn announcement(record: &DeviceRecord) -> DeviceAnnouncement {
    DeviceAnnouncement {
        ieee: record.ieee,
        nwk: record.nwk,
        manufacturer: record.manufacturer.clone(),
        model: record.model.clone(),
        endpoints: record.endpoints.clone(),
        node: record.node,
        capabilities: record.capabilities.clone(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ClusterCommand, ReportConfig};
    use crate::network::{DeviceNetwork, NetworkInfo, NetworkResult};
    use crate::simulator::SimulatedNetwork;
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use zigbridge_core::{AttributeValue, OnOffState};

    /// Network whose `device()` lookups hold until the gate opens, then
    /// answer with a fixed snapshot.
    struct GatedNetwork {
        inner: Arc<SimulatedNetwork>,
        snapshot: DeviceInfo,
        entered: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl DeviceNetwork for GatedNetwork {
        async fn initialize(&self) -> NetworkResult<NetworkInfo> {
            self.inner.initialize().await
        }

        fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
            self.inner.subscribe()
        }

        async fn devices(&self) -> NetworkResult<Vec<DeviceInfo>> {
            self.inner.devices().await
        }

        async fn device(&self, _ieee: &Ieee) -> NetworkResult<DeviceInfo> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(self.snapshot.clone())
        }

        async fn configure_reporting(
            &self,
            ieee: &Ieee,
            endpoint: u8,
            cluster_id: u16,
            reports: &[ReportConfig],
        ) -> NetworkResult<()> {
            self.inner
                .configure_reporting(ieee, endpoint, cluster_id, reports)
                .await
        }

        async fn send_command(
            &self,
            ieee: &Ieee,
            endpoint: u8,
            command: ClusterCommand,
        ) -> NetworkResult<()> {
            self.inner.send_command(ieee, endpoint, command).await
        }

        async fn read_attributes(
            &self,
            ieee: &Ieee,
            endpoint: u8,
            cluster_id: u16,
            attributes: &[&str],
        ) -> NetworkResult<()> {
            self.inner
                .read_attributes(ieee, endpoint, cluster_id, attributes)
                .await
        }

        async fn permit_join(&self, duration: Duration) -> NetworkResult<()> {
            self.inner.permit_join(duration).await
        }

        fn network_info(&self) -> Option<NetworkInfo> {
            self.inner.network_info()
        }

        async fn shutdown(&self) -> NetworkResult<()> {
            self.inner.shutdown().await
        }
    }

    async fn setup() -> (Arc<SimulatedNetwork>, GatewayAdapter) {
        let network = Arc::new(SimulatedNetwork::new());
        network.initialize().await.unwrap();
        let adapter = GatewayAdapter::new(
            NetworkHandle::with_network(network.clone()),
            EventBus::new(),
            &TimingConfig::default(),
        );
        (network, adapter)
    }

    fn bulb() -> DeviceInfo {
        DeviceInfo::new(Ieee::from_u64(0xb1), Nwk(0x00b1))
            .with_manufacturer("IKEA")
            .with_model("bulb")
            .with_endpoints(vec![EndpointDescriptor::new(1, vec![0x0006, 0x0008])])
    }

    #[tokio::test]
    async fn test_join_binds_and_announces() {
        let (network, adapter) = setup().await;
        let mut events = adapter.event_bus().subscribe();
        network.add_device(bulb());

        adapter
            .handle_event(NetworkEvent::DeviceJoined {
                ieee: Ieee::from_u64(0xb1),
                nwk: Nwk(0x00b1),
            })
            .await;

        let record = adapter
            .registry()
            .lookup_by_address(&Ieee::from_u64(0xb1))
            .await
            .unwrap();
        assert_eq!(record.binding_count(), 2);
        assert_eq!(network.reporting_configured().len(), 2);

        match events.recv().await.unwrap() {
            BridgeEvent::DeviceJoined(announcement) => {
                assert_eq!(announcement.model.as_deref(), Some("bulb"));
                assert!(announcement.capabilities.contains(&Capability::Light));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejoin_does_not_rebind() {
        let (network, adapter) = setup().await;
        network.add_device(bulb());
        let joined = NetworkEvent::DeviceJoined {
            ieee: Ieee::from_u64(0xb1),
            nwk: Nwk(0x00b1),
        };
        adapter.handle_event(joined.clone()).await;
        adapter.handle_event(joined).await;

        assert_eq!(network.reporting_configured().len(), 2);
        assert_eq!(adapter.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_on_off_report_feeds_switch_and_light() {
        let (network, adapter) = setup().await;
        network.add_device(bulb());
        adapter.sync_devices().await.unwrap();
        let mut events = adapter.event_bus().subscribe();

        adapter
            .handle_event(NetworkEvent::AttributeUpdated {
                ieee: Ieee::from_u64(0xb1),
                endpoint: 1,
                cluster_id: 0x0006,
                attribute: "on_off".into(),
                value: RawValue::Bool(true),
            })
            .await;

        let mut capabilities = Vec::new();
        while let Some(BridgeEvent::Attribute(event)) = events.try_recv() {
            assert_eq!(event.value, AttributeValue::OnOff(OnOffState::On));
            capabilities.push(event.capability);
        }
        assert_eq!(capabilities, vec![Capability::Switch, Capability::Light]);
    }

    #[tokio::test]
    async fn test_unbound_cluster_reports_are_ignored() {
        let (network, adapter) = setup().await;
        network.add_device(bulb());
        adapter.sync_devices().await.unwrap();
        let mut events = adapter.event_bus().subscribe();

        // Cluster not served by the endpoint.
        adapter
            .handle_event(NetworkEvent::AttributeUpdated {
                ieee: Ieee::from_u64(0xb1),
                endpoint: 1,
                cluster_id: 0x0402,
                attribute: "measured_value".into(),
                value: RawValue::Int(2000),
            })
            .await;
        // Unknown device.
        adapter
            .handle_event(NetworkEvent::AttributeUpdated {
                ieee: Ieee::from_u64(0xff),
                endpoint: 1,
                cluster_id: 0x0006,
                attribute: "on_off".into(),
                value: RawValue::Bool(true),
            })
            .await;
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_leave_emits_then_removes() {
        let (network, adapter) = setup().await;
        network.add_device(bulb());
        adapter.sync_devices().await.unwrap();
        let mut events = adapter.event_bus().subscribe();

        adapter
            .handle_event(NetworkEvent::DeviceLeft {
                ieee: Ieee::from_u64(0xb1),
                nwk: Nwk(0x00b1),
            })
            .await;

        assert_eq!(events.recv().await.unwrap().type_name(), "device_left");
        assert!(adapter
            .registry()
            .lookup_by_address(&Ieee::from_u64(0xb1))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_leave_during_join_keeps_device_out() {
        let inner = Arc::new(SimulatedNetwork::new());
        inner.initialize().await.unwrap();
        let network = Arc::new(GatedNetwork {
            inner,
            snapshot: bulb(),
            entered: Notify::new(),
            gate: Notify::new(),
        });
        let adapter = Arc::new(GatewayAdapter::new(
            NetworkHandle::with_network(network.clone()),
            EventBus::new(),
            &TimingConfig::default(),
        ));
        let mut events = adapter.event_bus().subscribe();
        let ieee = Ieee::from_u64(0xb1);

        let join = tokio::spawn({
            let adapter = adapter.clone();
            async move {
                adapter
                    .handle_event(NetworkEvent::DeviceJoined { ieee, nwk: Nwk(0x00b1) })
                    .await
            }
        });
        network.entered.notified().await;
        adapter
            .handle_event(NetworkEvent::DeviceLeft { ieee, nwk: Nwk(0x00b1) })
            .await;
        network.gate.notify_one();
        join.await.unwrap();

        assert!(adapter.registry().lookup_by_address(&ieee).await.is_none());
        assert_eq!(events.recv().await.unwrap().type_name(), "device_left");
        assert!(events.try_recv().is_none());

        // A later rejoin registers the device again.
        network.gate.notify_one();
        adapter
            .handle_event(NetworkEvent::DeviceJoined { ieee, nwk: Nwk(0x00b1) })
            .await;
        assert!(adapter.registry().lookup_by_address(&ieee).await.is_some());
        assert_eq!(events.recv().await.unwrap().type_name(), "device_joined");
    }

    #[tokio::test]
    async fn test_sync_skips_coordinator_binding() {
        let (_network, adapter) = setup().await;
        assert_eq!(adapter.sync_devices().await.unwrap(), 1);
        let record = adapter
            .registry()
            .lookup_by_address(&crate::simulator::COORDINATOR_IEEE)
            .await
            .unwrap();
        assert!(record.is_coordinator);
        assert_eq!(record.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_availability_rebinds() {
        let (network, adapter) = setup().await;
        let ieee = Ieee::from_u64(0xb1);
        network.add_device(bulb());
        adapter.sync_devices().await.unwrap();

        adapter
            .handle_event(NetworkEvent::AvailabilityChanged {
                ieee,
                available: false,
            })
            .await;
        let record = adapter.registry().lookup_by_address(&ieee).await.unwrap();
        assert_eq!(record.binding_count(), 0);

        adapter
            .handle_event(NetworkEvent::AvailabilityChanged {
                ieee,
                available: true,
            })
            .await;
        let record = adapter.registry().lookup_by_address(&ieee).await.unwrap();
        assert_eq!(record.binding_count(), 2);
        assert_eq!(network.reporting_configured().len(), 4);
    }
}
