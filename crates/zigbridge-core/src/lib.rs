//! Core types for the zigbridge mesh-to-MQTT bridge.
//!
//! This crate defines the vocabulary shared by every other crate: device
//! addresses, cluster kinds and capabilities, decoded attribute values, the
//! internal bridge events and the event bus that carries them, the error
//! taxonomy, and the configuration model.

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod types;

pub use config::{BridgeConfig, MqttConfig, NetworkConfig, SimulatorConfig, TimingConfig};
pub use error::{Error, Result};
pub use event::{
    iso_timestamp, AttributeValue, BridgeEvent, ColorState, DeviceAnnouncement, NormalizedEvent,
    OnOffState, ZoneFlag, ZoneStatus,
};
pub use eventbus::{EventBus, EventBusReceiver, DEFAULT_CHANNEL_CAPACITY};
pub use types::{
    AddressParseError, Capability, ClusterKind, EndpointDescriptor, Ieee, NodeDescriptor, Nwk,
    ZDO_ENDPOINT,
};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::BridgeConfig;
    pub use crate::error::{Error, Result};
    pub use crate::event::{AttributeValue, BridgeEvent, NormalizedEvent, OnOffState};
    pub use crate::eventbus::EventBus;
    pub use crate::types::{Capability, ClusterKind, Ieee, Nwk};
}
