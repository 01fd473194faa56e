//! Bridge-internal event types.
//!
//! The Gateway Adapter turns Device Network activity into these events and
//! publishes them on the [`EventBus`](crate::EventBus); the Bridge Core turns
//! them into broker messages.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::types::{Capability, EndpointDescriptor, Ieee, NodeDescriptor, Nwk};

/// ISO-8601 UTC rendering used in every outgoing payload.
pub fn iso_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Decoded on/off attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnOffState {
    On,
    Off,
}

impl OnOffState {
    pub const fn as_bool(self) -> bool {
        matches!(self, Self::On)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl From<bool> for OnOffState {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

impl FromStr for OnOffState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            other => Err(format!("expected \"on\" or \"off\", got {:?}", other)),
        }
    }
}

impl fmt::Display for OnOffState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named IAS zone status bits, in bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneFlag {
    Alarm1,
    Alarm2,
    Tamper,
    Battery,
    SupervisionReports,
    RestoreReports,
    Trouble,
    AcMains,
}

impl ZoneFlag {
    pub const ALL: [ZoneFlag; 8] = [
        ZoneFlag::Alarm1,
        ZoneFlag::Alarm2,
        ZoneFlag::Tamper,
        ZoneFlag::Battery,
        ZoneFlag::SupervisionReports,
        ZoneFlag::RestoreReports,
        ZoneFlag::Trouble,
        ZoneFlag::AcMains,
    ];

    pub const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alarm1 => "alarm1",
            Self::Alarm2 => "alarm2",
            Self::Tamper => "tamper",
            Self::Battery => "battery",
            Self::SupervisionReports => "supervision_reports",
            Self::RestoreReports => "restore_reports",
            Self::Trouble => "trouble",
            Self::AcMains => "ac_mains",
        }
    }
}

/// Decoded IAS zone status: raw bitmask plus the named flags it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneStatus {
    pub raw: u16,
    pub flags: Vec<ZoneFlag>,
}

/// Color state. Attribute reports fill one field at a time; commands fill
/// either hue/saturation or x/y.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ColorState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hue: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saturation: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_temp: Option<u16>,
}

/// Domain value decoded from a raw cluster attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    OnOff(OnOffState),
    Level(u8),
    Color(ColorState),
    ZoneStatus(ZoneStatus),
    Temperature(f64),
    Humidity(f64),
}

impl AttributeValue {
    /// State payload fields for this value (without `ieee`/`timestamp`).
    pub fn payload_fields(&self) -> Map<String, Value> {
        let value = match self {
            Self::OnOff(state) => json!({ "state": state.as_str() }),
            Self::Level(level) => json!({ "brightness": level }),
            Self::Color(color) => serde_json::to_value(color).unwrap_or_else(|_| json!({})),
            Self::ZoneStatus(status) => json!({
                "zone_status": status.raw,
                "zone_status_flags": status.flags.iter().map(|f| f.as_str()).collect::<Vec<_>>(),
            }),
            Self::Temperature(t) => json!({ "temperature": t }),
            Self::Humidity(h) => json!({ "humidity": h }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// One decoded attribute report (or confirmed command) for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub ieee: Ieee,
    pub capability: Capability,
    pub attribute: String,
    pub value: AttributeValue,
    pub timestamp: DateTime<Utc>,
}

impl NormalizedEvent {
    pub fn new(
        ieee: Ieee,
        capability: Capability,
        attribute: impl Into<String>,
        value: AttributeValue,
    ) -> Self {
        Self {
            ieee,
            capability,
            attribute: attribute.into(),
            value,
            timestamp: Utc::now(),
        }
    }

    /// Payload for the capability's retained `state` topic.
    pub fn state_payload(&self) -> Value {
        let mut map = self.value.payload_fields();
        map.insert("ieee".into(), json!(self.ieee.to_string()));
        map.insert("timestamp".into(), json!(iso_timestamp(&self.timestamp)));
        Value::Object(map)
    }
}

/// Everything the bridge knows about a device at the moment it joined.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAnnouncement {
    pub ieee: Ieee,
    pub nwk: Nwk,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub endpoints: BTreeMap<u8, EndpointDescriptor>,
    pub node: Option<NodeDescriptor>,
    pub capabilities: BTreeSet<Capability>,
    pub timestamp: DateTime<Utc>,
}

/// Events flowing from the Gateway Adapter to the Bridge Core.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// A device joined (or rejoined) and its endpoints were bridged.
    DeviceJoined(DeviceAnnouncement),

    /// A device left the network.
    DeviceLeft {
        ieee: Ieee,
        nwk: Nwk,
        timestamp: DateTime<Utc>,
    },

    /// Decoded attribute report.
    Attribute(NormalizedEvent),
}

impl BridgeEvent {
    pub fn ieee(&self) -> Ieee {
        match self {
            Self::DeviceJoined(announcement) => announcement.ieee,
            Self::DeviceLeft { ieee, .. } => *ieee,
            Self::Attribute(event) => event.ieee,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::DeviceJoined(_) => "device_joined",
            Self::DeviceLeft { .. } => "device_left",
            Self::Attribute(_) => "attribute",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_off_parse() {
        assert_eq!("ON".parse::<OnOffState>().unwrap(), OnOffState::On);
        assert_eq!("off".parse::<OnOffState>().unwrap(), OnOffState::Off);
        assert!("toggle".parse::<OnOffState>().is_err());
        assert_eq!(OnOffState::from(true), OnOffState::On);
    }

    #[test]
    fn test_zone_flag_bits() {
        assert_eq!(ZoneFlag::Alarm1.bit(), 0x0001);
        assert_eq!(ZoneFlag::Tamper.bit(), 0x0004);
        assert_eq!(ZoneFlag::AcMains.bit(), 0x0080);
    }

    #[test]
    fn test_state_payload_switch() {
        let ieee = Ieee::from_u64(0xabcd);
        let event = NormalizedEvent::new(
            ieee,
            Capability::Switch,
            "on_off",
            AttributeValue::OnOff(OnOffState::On),
        );
        let payload = event.state_payload();
        assert_eq!(payload["state"], "on");
        assert_eq!(payload["ieee"], "00:00:00:00:00:00:ab:cd");
        assert!(payload["timestamp"].as_str().unwrap().ends_with("+00:00"));
    }

    #[test]
    fn test_color_payload_skips_missing_fields() {
        let value = AttributeValue::Color(ColorState {
            x: Some(0.5),
            y: Some(0.25),
            ..Default::default()
        });
        let fields = value.payload_fields();
        assert_eq!(fields.len(), 2);
        assert!(fields.contains_key("x"));
        assert!(!fields.contains_key("hue"));
    }

    #[test]
    fn test_zone_payload() {
        let value = AttributeValue::ZoneStatus(ZoneStatus {
            raw: 5,
            flags: vec![ZoneFlag::Alarm1, ZoneFlag::Tamper],
        });
        let fields = value.payload_fields();
        assert_eq!(fields["zone_status"], 5);
        assert_eq!(fields["zone_status_flags"], json!(["alarm1", "tamper"]));
    }
}
