//! Zigbee device bridging for zigbridge.
//!
//! This crate connects a Zigbee Device Network to a publish/subscribe
//! Message Bus:
//!
//! - [`codec`]: cluster table, attribute decoding and command encoding
//! - [`registry`]: devices, endpoints, capabilities and cluster bindings
//! - [`topics`]: topic layout, in both directions
//! - [`adapter`]: Device Network events into registry updates and bridge events
//! - [`dispatcher`]: bus commands into Device Network calls, with retry
//! - [`refresher`]: periodic state reads
//! - [`bridge`]: lifecycle and the inbound/outbound pipelines
//!
//! The Device Network and the Message Bus are traits. [`SimulatedNetwork`]
//! and [`MemoryBus`] are in-memory implementations; [`MqttBus`] talks to a
//! real broker.

pub mod adapter;
pub mod bridge;
pub mod bus;
pub mod codec;
pub mod dispatcher;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod network;
pub mod refresher;
pub mod registry;
pub mod simulator;
pub mod topics;

pub use adapter::GatewayAdapter;
pub use bridge::{Bridge, PayloadError};
pub use bus::{BusError, BusMessage, BusResult, MemoryBus, MessageBus, Published};
pub use codec::{
    cluster_spec, decode, encode, ClusterCommand, ClusterSpec, ColorTarget, DecodeError,
    EncodeError, Operation, RawValue, ReportConfig,
};
pub use dispatcher::{
    Command, CommandDispatcher, DispatchOutcome, DispatchStats, PermitJoinOutcome, RetryPolicy,
};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttBus;
pub use network::{
    DeviceInfo, DeviceNetwork, NetworkError, NetworkEvent, NetworkHandle, NetworkInfo,
    NetworkResult,
};
pub use refresher::{PeriodicRefresher, SweepReport};
pub use registry::{ClusterBinding, DeviceRecord, DeviceRegistry, RegistryError, RegistryView};
pub use simulator::{Fault, ReadRequest, SentCommand, SimulatedNetwork, COORDINATOR_IEEE};
pub use topics::{Direction, Route, TopicError, TopicRouter};
