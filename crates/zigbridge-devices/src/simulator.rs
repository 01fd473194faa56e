//! Simulated Device Network.
//!
//! An in-memory [`DeviceNetwork`] that keeps per-device attribute state,
//! answers reads with attribute reports, applies commands to its state and
//! echoes the resulting reports. Faults can be scripted per device and
//! cluster so retry and refresh behaviour can be exercised without a radio.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use zigbridge_core::config::SimulatorConfig;
use zigbridge_core::{ClusterKind, EndpointDescriptor, Ieee, NodeDescriptor, Nwk};

use crate::codec::{ClusterCommand, RawValue, ReportConfig};
use crate::network::{
    DeviceInfo, DeviceNetwork, NetworkError, NetworkEvent, NetworkInfo, NetworkResult,
};

/// Address of the simulated coordinator.
pub const COORDINATOR_IEEE: Ieee = Ieee::from_u64(0x00124b_0000_000001);

/// Scripted failure for one simulated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail immediately with a network timeout.
    Timeout,
    /// Never answer.
    Hang,
    /// Fail immediately with a non-timeout error.
    Error(String),
}

/// One command call, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub ieee: Ieee,
    pub endpoint: u8,
    pub command: ClusterCommand,
    pub delivered: bool,
}

/// One read call, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub ieee: Ieee,
    pub endpoint: u8,
    pub cluster_id: u16,
    pub attributes: Vec<String>,
    pub delivered: bool,
}

type AttributeKey = (u8, u16, String);

struct SimDevice {
    info: DeviceInfo,
    /// Endpoints revealed by `finish_enumeration`.
    pending_endpoints: Option<Vec<EndpointDescriptor>>,
    attributes: HashMap<AttributeKey, RawValue>,
}

impl SimDevice {
    fn new(info: DeviceInfo) -> Self {
        let mut device = Self {
            info,
            pending_endpoints: None,
            attributes: HashMap::new(),
        };
        device.seed_attributes();
        device
    }

    fn seed_attributes(&mut self) {
        for ep in &self.info.endpoints {
            for kind in ep.supported_clusters() {
                let defaults: &[(&str, RawValue)] = match kind {
                    ClusterKind::OnOff => &[("on_off", RawValue::Bool(false))],
                    ClusterKind::LevelControl => &[("current_level", RawValue::Int(254))],
                    ClusterKind::ColorControl => &[
                        ("current_x", RawValue::Int(20_000)),
                        ("current_y", RawValue::Int(20_000)),
                        ("color_temperature", RawValue::Int(250)),
                    ],
                    ClusterKind::IasZone => &[("zone_status", RawValue::Int(0))],
                    ClusterKind::TemperatureMeasurement => {
                        &[("measured_value", RawValue::Int(2100))]
                    }
                    ClusterKind::RelativeHumidity => &[("measured_value", RawValue::Int(4500))],
                };
                for (attribute, value) in defaults {
                    self.attributes
                        .entry((ep.id, kind.id(), attribute.to_string()))
                        .or_insert(*value);
                }
            }
        }
    }

    /// Apply a command; returns the attributes it changed.
    fn apply(&mut self, endpoint: u8, command: ClusterCommand) -> Vec<(u16, &'static str, RawValue)> {
        let on_off = ClusterKind::OnOff.id();
        let level = ClusterKind::LevelControl.id();
        let color = ClusterKind::ColorControl.id();
        let changes: Vec<(u16, &'static str, RawValue)> = match command {
            ClusterCommand::On => vec![(on_off, "on_off", RawValue::Bool(true))],
            ClusterCommand::Off => vec![(on_off, "on_off", RawValue::Bool(false))],
            ClusterCommand::MoveToLevelWithOnOff { level: value, .. } => vec![
                (level, "current_level", RawValue::Int(value as i64)),
                (on_off, "on_off", RawValue::Bool(value > 0)),
            ],
            ClusterCommand::MoveToHueAndSaturation { hue, saturation, .. } => vec![
                (color, "current_hue", RawValue::Int(hue as i64)),
                (color, "current_saturation", RawValue::Int(saturation as i64)),
            ],
            ClusterCommand::MoveToColor { x, y, .. } => vec![
                (color, "current_x", RawValue::Int(x as i64)),
                (color, "current_y", RawValue::Int(y as i64)),
            ],
        };
        let served: Vec<u16> = self
            .info
            .endpoints
            .iter()
            .find(|ep| ep.id == endpoint)
            .map(|ep| ep.in_clusters.clone())
            .unwrap_or_default();
        changes
            .into_iter()
            .filter(|(cluster, _, _)| served.contains(cluster))
            .inspect(|(cluster, attribute, value)| {
                self.attributes
                    .insert((endpoint, *cluster, attribute.to_string()), *value);
            })
            .collect()
    }
}

/// In-memory Device Network.
pub struct SimulatedNetwork {
    params: NetworkInfo,
    events: broadcast::Sender<NetworkEvent>,
    devices: Mutex<BTreeMap<Ieee, SimDevice>>,
    faults: Mutex<HashMap<(Ieee, u16), VecDeque<Fault>>>,
    init_faults: Mutex<VecDeque<Fault>>,
    permit_faults: Mutex<VecDeque<Fault>>,
    commands: Mutex<Vec<SentCommand>>,
    reads: Mutex<Vec<ReadRequest>>,
    reporting: Mutex<Vec<(Ieee, u8, u16)>>,
    permit_joins: Mutex<Vec<Duration>>,
    initialized: AtomicBool,
    init_calls: AtomicUsize,
    shut_down: AtomicBool,
    echo_reports: AtomicBool,
    radio_timeout: Duration,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::with_params(NetworkInfo {
            channel: 15,
            pan_id: 0x1a62,
            extended_pan_id: Ieee::from_u64(0xdddd_dddd_dddd_dddd),
        })
    }

    pub fn with_params(params: NetworkInfo) -> Self {
        let (events, _) = broadcast::channel(1024);
        let network = Self {
            params,
            events,
            devices: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(HashMap::new()),
            init_faults: Mutex::new(VecDeque::new()),
            permit_faults: Mutex::new(VecDeque::new()),
            commands: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
            reporting: Mutex::new(Vec::new()),
            permit_joins: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            init_calls: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
            echo_reports: AtomicBool::new(true),
            radio_timeout: Duration::from_secs(30),
        };
        network.add_device(
            DeviceInfo::new(COORDINATOR_IEEE, Nwk(0x0000))
                .coordinator()
                .with_manufacturer("zigbridge")
                .with_model("simulated coordinator")
                .with_node(NodeDescriptor {
                    is_coordinator: true,
                    is_full_function_device: true,
                    ..Default::default()
                })
                .with_endpoints(vec![EndpointDescriptor::new(1, vec![0x0000])]),
        );
        network
    }

    /// Build a network seeded with the configured devices.
    pub fn from_config(channel: u8, config: &SimulatorConfig) -> Self {
        let network = Self::with_params(NetworkInfo {
            channel,
            pan_id: 0x1a62,
            extended_pan_id: Ieee::from_u64(0xdddd_dddd_dddd_dddd),
        });
        for device in &config.devices {
            let mut info = DeviceInfo::new(device.ieee, Nwk(device.nwk))
                .with_endpoints(device.endpoints.clone())
                .with_node(NodeDescriptor {
                    is_router: true,
                    is_full_function_device: true,
                    ..Default::default()
                });
            info.manufacturer = device.manufacturer.clone();
            info.model = device.model.clone();
            network.add_device(info);
        }
        network
    }

    /// Whether commands echo the attribute reports they caused.
    pub fn set_echo_reports(&self, echo: bool) {
        self.echo_reports.store(echo, Ordering::SeqCst);
    }

    /// Add a device as if loaded from the network database. No event.
    pub fn add_device(&self, info: DeviceInfo) {
        self.devices.lock().insert(info.ieee, SimDevice::new(info));
    }

    /// A device joins with its endpoints already enumerated.
    pub fn join_device(&self, info: DeviceInfo) {
        let (ieee, nwk) = (info.ieee, info.nwk);
        self.add_device(info);
        info!("Simulated device joined: {}", ieee);
        self.emit(NetworkEvent::DeviceJoined { ieee, nwk });
    }

    /// A device joins; its endpoints stay hidden until [`finish_enumeration`].
    ///
    /// [`finish_enumeration`]: Self::finish_enumeration
    pub fn join_device_pending(&self, mut info: DeviceInfo) {
        let (ieee, nwk) = (info.ieee, info.nwk);
        let endpoints = std::mem::take(&mut info.endpoints);
        let mut device = SimDevice::new(info);
        device.pending_endpoints = Some(endpoints);
        self.devices.lock().insert(ieee, device);
        self.emit(NetworkEvent::DeviceJoined { ieee, nwk });
    }

    /// Reveal the endpoints of a pending join.
    pub fn finish_enumeration(&self, ieee: &Ieee) {
        let endpoints = {
            let mut devices = self.devices.lock();
            let Some(device) = devices.get_mut(ieee) else {
                return;
            };
            let Some(endpoints) = device.pending_endpoints.take() else {
                return;
            };
            device.info.endpoints = endpoints.clone();
            device.seed_attributes();
            endpoints
        };
        self.emit(NetworkEvent::EndpointsEnumerated {
            ieee: *ieee,
            endpoints,
        });
    }

    pub fn leave_device(&self, ieee: &Ieee) {
        let removed = self.devices.lock().remove(ieee);
        if let Some(device) = removed {
            self.emit(NetworkEvent::DeviceLeft {
                ieee: *ieee,
                nwk: device.info.nwk,
            });
        }
    }

    pub fn set_available(&self, ieee: &Ieee, available: bool) {
        let changed = {
            let mut devices = self.devices.lock();
            match devices.get_mut(ieee) {
                Some(device) if device.info.available != available => {
                    device.info.available = available;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(NetworkEvent::AvailabilityChanged {
                ieee: *ieee,
                available,
            });
        }
    }

    /// Emit an unsolicited attribute report, updating device state.
    pub fn report_attribute(
        &self,
        ieee: &Ieee,
        endpoint: u8,
        cluster_id: u16,
        attribute: &str,
        value: RawValue,
    ) {
        if let Some(device) = self.devices.lock().get_mut(ieee) {
            device
                .attributes
                .insert((endpoint, cluster_id, attribute.to_string()), value);
        }
        self.emit(NetworkEvent::AttributeUpdated {
            ieee: *ieee,
            endpoint,
            cluster_id,
            attribute: attribute.to_string(),
            value,
        });
    }

    /// Queue faults for the next command/read calls on (device, cluster).
    pub fn script_faults(&self, ieee: Ieee, cluster_id: u16, faults: impl IntoIterator<Item = Fault>) {
        self.faults
            .lock()
            .entry((ieee, cluster_id))
            .or_default()
            .extend(faults);
    }

    pub fn script_initialize_faults(&self, faults: impl IntoIterator<Item = Fault>) {
        self.init_faults.lock().extend(faults);
    }

    pub fn script_permit_join_faults(&self, faults: impl IntoIterator<Item = Fault>) {
        self.permit_faults.lock().extend(faults);
    }

    pub fn sent_commands(&self) -> Vec<SentCommand> {
        self.commands.lock().clone()
    }

    pub fn reads(&self) -> Vec<ReadRequest> {
        self.reads.lock().clone()
    }

    pub fn reporting_configured(&self) -> Vec<(Ieee, u8, u16)> {
        self.reporting.lock().clone()
    }

    pub fn permit_join_calls(&self) -> Vec<Duration> {
        self.permit_joins.lock().clone()
    }

    pub fn initialize_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn attribute(&self, ieee: &Ieee, endpoint: u8, cluster_id: u16, attribute: &str) -> Option<RawValue> {
        self.devices
            .lock()
            .get(ieee)
            .and_then(|d| d.attributes.get(&(endpoint, cluster_id, attribute.to_string())).copied())
    }

    fn emit(&self, event: NetworkEvent) {
        // No subscribers is fine before the bridge starts.
        let _ = self.events.send(event);
    }

    fn take_fault(&self, ieee: &Ieee, cluster_id: u16) -> Option<Fault> {
        self.faults
            .lock()
            .get_mut(&(*ieee, cluster_id))
            .and_then(|queue| queue.pop_front())
    }

    async fn apply_fault(&self, fault: Option<Fault>) -> NetworkResult<()> {
        match fault {
            None => Ok(()),
            Some(Fault::Timeout) => Err(NetworkError::Timeout(self.radio_timeout)),
            Some(Fault::Error(message)) => Err(NetworkError::Other(message)),
            Some(Fault::Hang) => std::future::pending().await,
        }
    }

    fn ensure_ready(&self) -> NetworkResult<()> {
        if self.shut_down.load(Ordering::SeqCst) || !self.initialized.load(Ordering::SeqCst) {
            return Err(NetworkError::NotReady);
        }
        Ok(())
    }
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceNetwork for SimulatedNetwork {
    async fn initialize(&self) -> NetworkResult<NetworkInfo> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.init_faults.lock().pop_front();
        self.apply_fault(fault).await?;
        self.initialized.store(true, Ordering::SeqCst);
        self.shut_down.store(false, Ordering::SeqCst);
        info!(
            "Simulated network up on channel {}, pan 0x{:04x}",
            self.params.channel, self.params.pan_id
        );
        Ok(self.params)
    }

    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    async fn devices(&self) -> NetworkResult<Vec<DeviceInfo>> {
        self.ensure_ready()?;
        Ok(self.devices.lock().values().map(|d| d.info.clone()).collect())
    }

    async fn device(&self, ieee: &Ieee) -> NetworkResult<DeviceInfo> {
        self.devices
            .lock()
            .get(ieee)
            .map(|d| d.info.clone())
            .ok_or(NetworkError::DeviceNotFound(*ieee))
    }

    async fn configure_reporting(
        &self,
        ieee: &Ieee,
        endpoint: u8,
        cluster_id: u16,
        reports: &[ReportConfig],
    ) -> NetworkResult<()> {
        self.ensure_ready()?;
        if !self.devices.lock().contains_key(ieee) {
            return Err(NetworkError::DeviceNotFound(*ieee));
        }
        debug!(
            "Reporting configured on {} ep {} cluster 0x{:04x} ({} attributes)",
            ieee,
            endpoint,
            cluster_id,
            reports.len()
        );
        self.reporting.lock().push((*ieee, endpoint, cluster_id));
        Ok(())
    }

    async fn send_command(
        &self,
        ieee: &Ieee,
        endpoint: u8,
        command: ClusterCommand,
    ) -> NetworkResult<()> {
        self.ensure_ready()?;
        let fault = self.take_fault(ieee, command.cluster().id());
        let result = match self.apply_fault(fault).await {
            Ok(()) => self
                .devices
                .lock()
                .get_mut(ieee)
                .map(|device| device.apply(endpoint, command))
                .ok_or(NetworkError::DeviceNotFound(*ieee)),
            Err(e) => Err(e),
        };

        self.commands.lock().push(SentCommand {
            ieee: *ieee,
            endpoint,
            command,
            delivered: result.is_ok(),
        });

        let changes = result?;
        if self.echo_reports.load(Ordering::SeqCst) {
            for (cluster_id, attribute, value) in changes {
                self.emit(NetworkEvent::AttributeUpdated {
                    ieee: *ieee,
                    endpoint,
                    cluster_id,
                    attribute: attribute.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }

    async fn read_attributes(
        &self,
        ieee: &Ieee,
        endpoint: u8,
        cluster_id: u16,
        attributes: &[&str],
    ) -> NetworkResult<()> {
        self.ensure_ready()?;
        let fault = self.take_fault(ieee, cluster_id);
        let result = self.apply_fault(fault).await;
        self.reads.lock().push(ReadRequest {
            ieee: *ieee,
            endpoint,
            cluster_id,
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            delivered: result.is_ok(),
        });
        result?;

        let values: Vec<(String, RawValue)> = {
            let devices = self.devices.lock();
            let device = devices.get(ieee).ok_or(NetworkError::DeviceNotFound(*ieee))?;
            attributes
                .iter()
                .filter_map(|attribute| {
                    device
                        .attributes
                        .get(&(endpoint, cluster_id, attribute.to_string()))
                        .map(|value| (attribute.to_string(), *value))
                })
                .collect()
        };
        for (attribute, value) in values {
            self.emit(NetworkEvent::AttributeUpdated {
                ieee: *ieee,
                endpoint,
                cluster_id,
                attribute,
                value,
            });
        }
        Ok(())
    }

    async fn permit_join(&self, duration: Duration) -> NetworkResult<()> {
        self.ensure_ready()?;
        let fault = self.permit_faults.lock().pop_front();
        self.permit_joins.lock().push(duration);
        self.apply_fault(fault).await
    }

    fn network_info(&self) -> Option<NetworkInfo> {
        self.initialized
            .load(Ordering::SeqCst)
            .then(|| self.params)
    }

    async fn shutdown(&self) -> NetworkResult<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        info!("Simulated network released");
        Ok(())
    }
}
