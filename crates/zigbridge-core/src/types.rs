//! Addresses, cluster kinds and capabilities.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Endpoint 0 is the network-management (ZDO) endpoint and is never bridged.
pub const ZDO_ENDPOINT: u8 = 0;

/// Error returned when an IEEE address string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid IEEE address: {0}")]
pub struct AddressParseError(pub String);

/// Stable 64-bit device address.
///
/// Rendered as eight colon-separated lowercase hex bytes, most significant
/// first (`00:0d:6f:00:0a:bc:de:f0`). Parsing also accepts the bare 16-digit
/// hex form with an optional `0x` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ieee([u8; 8]);

impl Ieee {
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub const fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub const fn bytes(&self) -> [u8; 8] {
        self.0
    }
}

impl fmt::Display for Ieee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl FromStr for Ieee {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AddressParseError(s.to_string());

        if s.contains(':') {
            let parts: Vec<&str> = s.split(':').collect();
            if parts.len() != 8 {
                return Err(err());
            }
            let mut bytes = [0u8; 8];
            for (slot, part) in bytes.iter_mut().zip(parts) {
                if part.len() != 2 {
                    return Err(err());
                }
                *slot = u8::from_str_radix(part, 16).map_err(|_| err())?;
            }
            return Ok(Self(bytes));
        }

        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if hex.len() != 16 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(err());
        }
        u64::from_str_radix(hex, 16)
            .map(Self::from_u64)
            .map_err(|_| err())
    }
}

impl Serialize for Ieee {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ieee {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Short 16-bit network address, reassigned when a device rejoins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nwk(pub u16);

impl fmt::Display for Nwk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Cluster kinds the bridge knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    OnOff,
    LevelControl,
    ColorControl,
    IasZone,
    TemperatureMeasurement,
    RelativeHumidity,
}

impl ClusterKind {
    pub const ALL: [ClusterKind; 6] = [
        ClusterKind::OnOff,
        ClusterKind::LevelControl,
        ClusterKind::ColorControl,
        ClusterKind::IasZone,
        ClusterKind::TemperatureMeasurement,
        ClusterKind::RelativeHumidity,
    ];

    /// Numeric cluster identifier.
    pub const fn id(self) -> u16 {
        match self {
            Self::OnOff => 0x0006,
            Self::LevelControl => 0x0008,
            Self::ColorControl => 0x0300,
            Self::IasZone => 0x0500,
            Self::TemperatureMeasurement => 0x0402,
            Self::RelativeHumidity => 0x0405,
        }
    }

    /// Look up a supported cluster by identifier.
    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::OnOff => "on_off",
            Self::LevelControl => "level",
            Self::ColorControl => "color",
            Self::IasZone => "ias_zone",
            Self::TemperatureMeasurement => "temperature",
            Self::RelativeHumidity => "humidity",
        }
    }
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:04x})", self.name(), self.id())
    }
}

/// Bridge-level semantic tag derived from a device's inbound clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Switch,
    Light,
    Brightness,
    Color,
    IasZone,
    Temperature,
    Humidity,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Switch,
        Capability::Light,
        Capability::Brightness,
        Capability::Color,
        Capability::IasZone,
        Capability::Temperature,
        Capability::Humidity,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Switch => "switch",
            Self::Light => "light",
            Self::Brightness => "brightness",
            Self::Color => "color",
            Self::IasZone => "ias_zone",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
        }
    }

    /// Topic segment(s) between the device address and the direction.
    pub const fn topic_path(self) -> &'static str {
        match self {
            Self::Switch => "switch",
            Self::Light => "light",
            Self::Brightness => "light/brightness",
            Self::Color => "light/color",
            Self::IasZone => "ias_zone",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
        }
    }

    pub fn from_topic_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cap| cap.topic_path() == path)
    }

    /// The cluster that serves commands and reports for this capability.
    pub const fn cluster(self) -> ClusterKind {
        match self {
            Self::Switch | Self::Light => ClusterKind::OnOff,
            Self::Brightness => ClusterKind::LevelControl,
            Self::Color => ClusterKind::ColorControl,
            Self::IasZone => ClusterKind::IasZone,
            Self::Temperature => ClusterKind::TemperatureMeasurement,
            Self::Humidity => ClusterKind::RelativeHumidity,
        }
    }

    /// Whether the bus may send `set` commands for this capability.
    pub const fn is_commandable(self) -> bool {
        matches!(
            self,
            Self::Switch | Self::Light | Self::Brightness | Self::Color
        )
    }

    /// Capabilities exposed by one endpoint's inbound cluster list.
    ///
    /// An on/off cluster paired with level or color control is also a light.
    pub fn derive(in_clusters: &[u16]) -> BTreeSet<Capability> {
        let has = |kind: ClusterKind| in_clusters.contains(&kind.id());
        let mut caps = BTreeSet::new();

        if has(ClusterKind::OnOff) {
            caps.insert(Self::Switch);
            if has(ClusterKind::LevelControl) || has(ClusterKind::ColorControl) {
                caps.insert(Self::Light);
            }
        }
        if has(ClusterKind::LevelControl) {
            caps.insert(Self::Brightness);
        }
        if has(ClusterKind::ColorControl) {
            caps.insert(Self::Color);
        }
        if has(ClusterKind::IasZone) {
            caps.insert(Self::IasZone);
        }
        if has(ClusterKind::TemperatureMeasurement) {
            caps.insert(Self::Temperature);
        }
        if has(ClusterKind::RelativeHumidity) {
            caps.insert(Self::Humidity);
        }
        caps
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One endpoint as enumerated by the Device Network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub id: u8,
    #[serde(default = "default_profile_id")]
    pub profile_id: u16,
    #[serde(default)]
    pub device_type: u16,
    #[serde(default)]
    pub in_clusters: Vec<u16>,
    #[serde(default)]
    pub out_clusters: Vec<u16>,
}

fn default_profile_id() -> u16 {
    0x0104
}

impl EndpointDescriptor {
    pub fn new(id: u8, in_clusters: Vec<u16>) -> Self {
        Self {
            id,
            profile_id: default_profile_id(),
            device_type: 0,
            in_clusters,
            out_clusters: Vec::new(),
        }
    }

    pub fn with_device_type(mut self, device_type: u16) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_out_clusters(mut self, out_clusters: Vec<u16>) -> Self {
        self.out_clusters = out_clusters;
        self
    }

    /// Supported cluster kinds in this endpoint's inbound list, in list order.
    pub fn supported_clusters(&self) -> impl Iterator<Item = ClusterKind> + '_ {
        self.in_clusters.iter().filter_map(|id| ClusterKind::from_id(*id))
    }
}

/// Node descriptor summary reported by the Device Network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub is_coordinator: bool,
    pub is_router: bool,
    pub is_end_device: bool,
    pub is_full_function_device: bool,
    pub manufacturer_code: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ieee_display_and_parse() {
        let ieee = Ieee::from_u64(0x000d_6f00_0abc_def0);
        assert_eq!(ieee.to_string(), "00:0d:6f:00:0a:bc:de:f0");
        assert_eq!("00:0d:6f:00:0a:bc:de:f0".parse::<Ieee>().unwrap(), ieee);
        assert_eq!("000D6F000ABCDEF0".parse::<Ieee>().unwrap(), ieee);
        assert_eq!("0x000d6f000abcdef0".parse::<Ieee>().unwrap(), ieee);
    }

    #[test]
    fn test_ieee_rejects_garbage() {
        assert!("joined".parse::<Ieee>().is_err());
        assert!("00:0d:6f:00:0a:bc:de".parse::<Ieee>().is_err());
        assert!("00:0d:6f:00:0a:bc:de:f0:11".parse::<Ieee>().is_err());
        assert!("0:0d:6f:00:0a:bc:de:f0".parse::<Ieee>().is_err());
        assert!("zz:0d:6f:00:0a:bc:de:f0".parse::<Ieee>().is_err());
        assert!("".parse::<Ieee>().is_err());
    }

    #[test]
    fn test_ieee_serde_as_string() {
        let ieee = Ieee::from_u64(1);
        let json = serde_json::to_string(&ieee).unwrap();
        assert_eq!(json, "\"00:00:00:00:00:00:00:01\"");
        let back: Ieee = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ieee);
    }

    #[test]
    fn test_cluster_ids() {
        for kind in ClusterKind::ALL {
            assert_eq!(ClusterKind::from_id(kind.id()), Some(kind));
        }
        assert_eq!(ClusterKind::from_id(0x0201), None);
        assert_eq!(ClusterKind::OnOff.to_string(), "on_off(0x0006)");
    }

    #[test]
    fn test_capability_topic_paths_unique() {
        for cap in Capability::ALL {
            assert_eq!(Capability::from_topic_path(cap.topic_path()), Some(cap));
        }
    }

    #[test]
    fn test_capability_derivation() {
        let plug = Capability::derive(&[0x0000, 0x0006]);
        assert_eq!(plug.into_iter().collect::<Vec<_>>(), vec![Capability::Switch]);

        let bulb = Capability::derive(&[0x0006, 0x0008, 0x0300]);
        assert!(bulb.contains(&Capability::Light));
        assert!(bulb.contains(&Capability::Brightness));
        assert!(bulb.contains(&Capability::Color));

        let sensor = Capability::derive(&[0x0402, 0x0405, 0x0500]);
        assert_eq!(sensor.len(), 3);
        assert!(!sensor.contains(&Capability::Switch));
    }
}
