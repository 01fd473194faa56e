//! Device Network interface.
//!
//! The mesh radio stack is an external collaborator. The bridge only sees it
//! through the [`DeviceNetwork`] trait: lifecycle and attribute events on a
//! broadcast channel, plus a handful of request/response operations that may
//! suspend for as long as a remote device takes to answer.
//!
//! Components never hold the network directly. They hold a
//! [`NetworkHandle`] and dereference it at call time, so the bridge can swap
//! or release the live network in one place.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use zigbridge_core::{EndpointDescriptor, Ieee, NodeDescriptor, Nwk};

use crate::codec::{ClusterCommand, RawValue, ReportConfig};

/// Result type for Device Network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Error type for Device Network operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// The remote device did not answer in time. The only retried class.
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// Radio or coordinator unreachable.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(Ieee),

    /// The network has not been initialised or was released.
    #[error("Device network is not ready")]
    NotReady,

    /// Command rejected or failed on the device.
    #[error("Network error: {0}")]
    Other(String),
}

impl NetworkError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Network parameters reported by the coordinator after initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub channel: u8,
    pub pan_id: u16,
    pub extended_pan_id: Ieee,
}

/// A device as reported by the Device Network.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub ieee: Ieee,
    pub nwk: Nwk,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub is_coordinator: bool,
    pub available: bool,
    pub node: Option<NodeDescriptor>,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl DeviceInfo {
    pub fn new(ieee: Ieee, nwk: Nwk) -> Self {
        Self {
            ieee,
            nwk,
            manufacturer: None,
            model: None,
            is_coordinator: false,
            available: true,
            node: None,
            endpoints: Vec::new(),
        }
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<EndpointDescriptor>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_node(mut self, node: NodeDescriptor) -> Self {
        self.node = Some(node);
        self
    }

    pub fn coordinator(mut self) -> Self {
        self.is_coordinator = true;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

/// Events raised by the Device Network.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// A device joined or rejoined. Endpoints may still be enumerating.
    DeviceJoined { ieee: Ieee, nwk: Nwk },

    DeviceLeft { ieee: Ieee, nwk: Nwk },

    /// Endpoint and cluster enumeration finished for a device.
    EndpointsEnumerated {
        ieee: Ieee,
        endpoints: Vec<EndpointDescriptor>,
    },

    /// A cluster attribute changed (report or read response).
    AttributeUpdated {
        ieee: Ieee,
        endpoint: u8,
        cluster_id: u16,
        attribute: String,
        value: RawValue,
    },

    AvailabilityChanged { ieee: Ieee, available: bool },
}

impl NetworkEvent {
    pub fn ieee(&self) -> Ieee {
        match self {
            Self::DeviceJoined { ieee, .. }
            | Self::DeviceLeft { ieee, .. }
            | Self::EndpointsEnumerated { ieee, .. }
            | Self::AttributeUpdated { ieee, .. }
            | Self::AvailabilityChanged { ieee, .. } => *ieee,
        }
    }
}

/// The mesh network as seen by the bridge.
#[async_trait]
pub trait DeviceNetwork: Send + Sync {
    /// Bring the network up (form or resume) and report its parameters.
    async fn initialize(&self) -> NetworkResult<NetworkInfo>;

    /// Subscribe to network events.
    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent>;

    /// Devices known to the network, including the persisted ones.
    async fn devices(&self) -> NetworkResult<Vec<DeviceInfo>>;

    /// Look up one device. Endpoints are empty until enumeration finished.
    async fn device(&self, ieee: &Ieee) -> NetworkResult<DeviceInfo>;

    /// Configure attribute reporting for one cluster on one endpoint.
    async fn configure_reporting(
        &self,
        ieee: &Ieee,
        endpoint: u8,
        cluster_id: u16,
        reports: &[ReportConfig],
    ) -> NetworkResult<()>;

    /// Send a cluster command and wait for the device to acknowledge it.
    async fn send_command(
        &self,
        ieee: &Ieee,
        endpoint: u8,
        command: ClusterCommand,
    ) -> NetworkResult<()>;

    /// Read attributes; answers arrive as `AttributeUpdated` events.
    async fn read_attributes(
        &self,
        ieee: &Ieee,
        endpoint: u8,
        cluster_id: u16,
        attributes: &[&str],
    ) -> NetworkResult<()>;

    /// Open the network for joining for `duration` (zero closes it).
    async fn permit_join(&self, duration: Duration) -> NetworkResult<()>;

    /// Current network parameters, if initialised.
    fn network_info(&self) -> Option<NetworkInfo>;

    /// Release the radio.
    async fn shutdown(&self) -> NetworkResult<()>;
}

/// Shared, replaceable reference to the live Device Network.
#[derive(Clone, Default)]
pub struct NetworkHandle {
    inner: Arc<RwLock<Option<Arc<dyn DeviceNetwork>>>>,
}

impl NetworkHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network(network: Arc<dyn DeviceNetwork>) -> Self {
        let handle = Self::new();
        handle.update(network);
        handle
    }

    /// The live network, or `NotReady`.
    pub fn current(&self) -> NetworkResult<Arc<dyn DeviceNetwork>> {
        self.inner.read().clone().ok_or(NetworkError::NotReady)
    }

    pub fn update(&self, network: Arc<dyn DeviceNetwork>) {
        *self.inner.write() = Some(network);
    }

    /// Drop the live network, returning it for a final shutdown call.
    pub fn release(&self) -> Option<Arc<dyn DeviceNetwork>> {
        self.inner.write().take()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.read().is_some()
    }
}
