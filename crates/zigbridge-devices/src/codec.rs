//! Attribute codec.
//!
//! Pure mapping between raw cluster attribute values and domain values, plus
//! encoding of bridge operations into cluster commands. Every supported
//! cluster kind has one entry in a static dispatch table ([`cluster_spec`])
//! carrying its reporting configuration, refresh attributes and decoder.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zigbridge_core::{
    AttributeValue, Capability, ClusterKind, ColorState, OnOffState, ZoneFlag, ZoneStatus,
};

/// Full scale of the color x/y axes.
pub const COLOR_XY_SCALE: f64 = 65535.0;

/// Largest valid hue or saturation value.
pub const MAX_HUE_SATURATION: u8 = 254;

/// ZCL "invalid measurement" marker for signed temperature values.
const TEMPERATURE_INVALID: i64 = -0x8000;

/// Raw attribute value as delivered by the Device Network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Bool(bool),
    Int(i64),
}

impl RawValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
        }
    }
}

/// Error decoding a raw attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("attribute {attribute} is not handled for cluster {cluster}")]
    UnknownAttribute {
        cluster: ClusterKind,
        attribute: String,
    },

    #[error("attribute {attribute}: expected {expected}, got {got}")]
    TypeMismatch {
        attribute: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("attribute {attribute}: value {value} out of range")]
    OutOfRange { attribute: String, value: i64 },
}

impl DecodeError {
    /// Attributes outside the table are expected traffic, not faults.
    pub fn is_unknown_attribute(&self) -> bool {
        matches!(self, Self::UnknownAttribute { .. })
    }
}

/// Error encoding an operation for a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("operation {operation} is not supported by cluster {cluster}")]
    Unsupported {
        cluster: ClusterKind,
        operation: &'static str,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Attribute reporting configuration: (min interval, max interval, change).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportConfig {
    pub attribute: &'static str,
    pub min_interval: u16,
    pub max_interval: u16,
    pub reportable_change: u32,
}

const fn immediate(attribute: &'static str) -> ReportConfig {
    ReportConfig {
        attribute,
        min_interval: 0,
        max_interval: 900,
        reportable_change: 1,
    }
}

const fn asap(attribute: &'static str) -> ReportConfig {
    ReportConfig {
        attribute,
        min_interval: 1,
        max_interval: 900,
        reportable_change: 1,
    }
}

const fn default_report(attribute: &'static str) -> ReportConfig {
    ReportConfig {
        attribute,
        min_interval: 30,
        max_interval: 900,
        reportable_change: 1,
    }
}

type Decoder = fn(&str, RawValue) -> Result<AttributeValue, DecodeError>;

/// Dispatch table entry for one cluster kind.
pub struct ClusterSpec {
    pub kind: ClusterKind,
    /// Capability whose `state` topic receives this cluster's reports.
    pub capability: Capability,
    pub reporting: &'static [ReportConfig],
    /// Attributes read by the periodic refresher.
    pub refresh_attributes: &'static [&'static str],
    decoder: Decoder,
}

impl ClusterSpec {
    pub fn decode(&self, attribute: &str, raw: RawValue) -> Result<AttributeValue, DecodeError> {
        (self.decoder)(attribute, raw)
    }
}

static ON_OFF: ClusterSpec = ClusterSpec {
    kind: ClusterKind::OnOff,
    capability: Capability::Switch,
    reporting: &[immediate("on_off")],
    refresh_attributes: &["on_off"],
    decoder: decode_on_off,
};

static LEVEL: ClusterSpec = ClusterSpec {
    kind: ClusterKind::LevelControl,
    capability: Capability::Brightness,
    reporting: &[asap("current_level")],
    refresh_attributes: &["current_level"],
    decoder: decode_level,
};

static COLOR: ClusterSpec = ClusterSpec {
    kind: ClusterKind::ColorControl,
    capability: Capability::Color,
    reporting: &[
        default_report("current_x"),
        default_report("current_y"),
        default_report("color_temperature"),
    ],
    refresh_attributes: &["current_x", "current_y", "color_temperature"],
    decoder: decode_color,
};

static IAS_ZONE: ClusterSpec = ClusterSpec {
    kind: ClusterKind::IasZone,
    capability: Capability::IasZone,
    reporting: &[immediate("zone_status")],
    refresh_attributes: &["zone_status"],
    decoder: decode_zone_status,
};

static TEMPERATURE: ClusterSpec = ClusterSpec {
    kind: ClusterKind::TemperatureMeasurement,
    capability: Capability::Temperature,
    reporting: &[default_report("measured_value")],
    refresh_attributes: &["measured_value"],
    decoder: decode_temperature,
};

static HUMIDITY: ClusterSpec = ClusterSpec {
    kind: ClusterKind::RelativeHumidity,
    capability: Capability::Humidity,
    reporting: &[default_report("measured_value")],
    refresh_attributes: &["measured_value"],
    decoder: decode_humidity,
};

/// Look up the dispatch table entry for a cluster kind.
pub fn cluster_spec(kind: ClusterKind) -> &'static ClusterSpec {
    match kind {
        ClusterKind::OnOff => &ON_OFF,
        ClusterKind::LevelControl => &LEVEL,
        ClusterKind::ColorControl => &COLOR,
        ClusterKind::IasZone => &IAS_ZONE,
        ClusterKind::TemperatureMeasurement => &TEMPERATURE,
        ClusterKind::RelativeHumidity => &HUMIDITY,
    }
}

/// Decode a raw attribute value for a cluster.
pub fn decode(
    kind: ClusterKind,
    attribute: &str,
    raw: RawValue,
) -> Result<AttributeValue, DecodeError> {
    cluster_spec(kind).decode(attribute, raw)
}

fn unknown(kind: ClusterKind, attribute: &str) -> DecodeError {
    DecodeError::UnknownAttribute {
        cluster: kind,
        attribute: attribute.to_string(),
    }
}

/// Integer in `[min, max]`.
fn int_in(attribute: &str, raw: RawValue, min: i64, max: i64) -> Result<i64, DecodeError> {
    match raw {
        RawValue::Int(value) if (min..=max).contains(&value) => Ok(value),
        RawValue::Int(value) => Err(DecodeError::OutOfRange {
            attribute: attribute.to_string(),
            value,
        }),
        other => Err(DecodeError::TypeMismatch {
            attribute: attribute.to_string(),
            expected: "int",
            got: other.kind(),
        }),
    }
}

fn decode_on_off(attribute: &str, raw: RawValue) -> Result<AttributeValue, DecodeError> {
    if attribute != "on_off" {
        return Err(unknown(ClusterKind::OnOff, attribute));
    }
    let on = match raw {
        RawValue::Bool(on) => on,
        RawValue::Int(_) => int_in(attribute, raw, 0, 1)? == 1,
    };
    Ok(AttributeValue::OnOff(OnOffState::from(on)))
}

fn decode_level(attribute: &str, raw: RawValue) -> Result<AttributeValue, DecodeError> {
    if attribute != "current_level" {
        return Err(unknown(ClusterKind::LevelControl, attribute));
    }
    let level = int_in(attribute, raw, 0, 255)?;
    Ok(AttributeValue::Level(level as u8))
}

fn decode_color(attribute: &str, raw: RawValue) -> Result<AttributeValue, DecodeError> {
    let mut color = ColorState::default();
    match attribute {
        "current_x" => color.x = Some(int_in(attribute, raw, 0, 65535)? as f64 / COLOR_XY_SCALE),
        "current_y" => color.y = Some(int_in(attribute, raw, 0, 65535)? as f64 / COLOR_XY_SCALE),
        "current_hue" => {
            color.hue = Some(int_in(attribute, raw, 0, MAX_HUE_SATURATION as i64)? as u8)
        }
        "current_saturation" => {
            color.saturation = Some(int_in(attribute, raw, 0, MAX_HUE_SATURATION as i64)? as u8)
        }
        "color_temperature" => color.color_temp = Some(int_in(attribute, raw, 0, 65535)? as u16),
        _ => return Err(unknown(ClusterKind::ColorControl, attribute)),
    }
    Ok(AttributeValue::Color(color))
}

fn decode_zone_status(attribute: &str, raw: RawValue) -> Result<AttributeValue, DecodeError> {
    if attribute != "zone_status" {
        return Err(unknown(ClusterKind::IasZone, attribute));
    }
    let bits = int_in(attribute, raw, 0, u16::MAX as i64)? as u16;
    let flags = ZoneFlag::ALL
        .into_iter()
        .filter(|flag| bits & flag.bit() != 0)
        .collect();
    Ok(AttributeValue::ZoneStatus(ZoneStatus { raw: bits, flags }))
}

fn decode_temperature(attribute: &str, raw: RawValue) -> Result<AttributeValue, DecodeError> {
    if attribute != "measured_value" {
        return Err(unknown(ClusterKind::TemperatureMeasurement, attribute));
    }
    let value = int_in(attribute, raw, i16::MIN as i64, i16::MAX as i64)?;
    if value == TEMPERATURE_INVALID {
        return Err(DecodeError::OutOfRange {
            attribute: attribute.to_string(),
            value,
        });
    }
    Ok(AttributeValue::Temperature(value as f64 / 100.0))
}

fn decode_humidity(attribute: &str, raw: RawValue) -> Result<AttributeValue, DecodeError> {
    if attribute != "measured_value" {
        return Err(unknown(ClusterKind::RelativeHumidity, attribute));
    }
    let value = int_in(attribute, raw, 0, 10_000)?;
    Ok(AttributeValue::Humidity(value as f64 / 100.0))
}

/// Target color of a color command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColorTarget {
    HueSaturation { hue: u8, saturation: u8 },
    Xy { x: f64, y: f64 },
}

/// Operation requested from the bus against a capability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    SetState(OnOffState),
    SetBrightness(u8),
    SetColor(ColorTarget),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetState(_) => "set_state",
            Self::SetBrightness(_) => "set_brightness",
            Self::SetColor(_) => "set_color",
        }
    }

    /// Domain value the device holds once the operation succeeded.
    pub fn applied_value(&self) -> AttributeValue {
        match *self {
            Self::SetState(state) => AttributeValue::OnOff(state),
            Self::SetBrightness(level) => AttributeValue::Level(level),
            Self::SetColor(ColorTarget::HueSaturation { hue, saturation }) => {
                AttributeValue::Color(ColorState {
                    hue: Some(hue),
                    saturation: Some(saturation),
                    ..Default::default()
                })
            }
            Self::SetColor(ColorTarget::Xy { x, y }) => AttributeValue::Color(ColorState {
                x: Some(x),
                y: Some(y),
                ..Default::default()
            }),
        }
    }
}

/// Raw cluster command ready for the Device Network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterCommand {
    Off,
    On,
    MoveToLevelWithOnOff {
        level: u8,
        transition_time: u16,
    },
    MoveToHueAndSaturation {
        hue: u8,
        saturation: u8,
        transition_time: u16,
    },
    MoveToColor {
        x: u16,
        y: u16,
        transition_time: u16,
    },
}

impl ClusterCommand {
    pub fn cluster(&self) -> ClusterKind {
        match self {
            Self::Off | Self::On => ClusterKind::OnOff,
            Self::MoveToLevelWithOnOff { .. } => ClusterKind::LevelControl,
            Self::MoveToHueAndSaturation { .. } | Self::MoveToColor { .. } => {
                ClusterKind::ColorControl
            }
        }
    }

    /// ZCL command identifier within the cluster.
    pub fn command_id(&self) -> u8 {
        match self {
            Self::Off => 0x00,
            Self::On => 0x01,
            Self::MoveToLevelWithOnOff { .. } => 0x04,
            Self::MoveToHueAndSaturation { .. } => 0x06,
            Self::MoveToColor { .. } => 0x07,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
            Self::MoveToLevelWithOnOff { .. } => "move_to_level_with_on_off",
            Self::MoveToHueAndSaturation { .. } => "move_to_hue_and_saturation",
            Self::MoveToColor { .. } => "move_to_color",
        }
    }
}

/// Scale a fractional color axis to its raw value: `round(v * 65535)`, clamped.
pub fn encode_color_axis(value: f64) -> Result<u16, EncodeError> {
    if !value.is_finite() {
        return Err(EncodeError::InvalidParameter(format!(
            "color axis {} is not a number",
            value
        )));
    }
    Ok((value * COLOR_XY_SCALE).round().clamp(0.0, COLOR_XY_SCALE) as u16)
}

/// Encode an operation into the command for the given cluster.
pub fn encode(kind: ClusterKind, operation: &Operation) -> Result<ClusterCommand, EncodeError> {
    let command = match (kind, *operation) {
        (ClusterKind::OnOff, Operation::SetState(OnOffState::On)) => ClusterCommand::On,
        (ClusterKind::OnOff, Operation::SetState(OnOffState::Off)) => ClusterCommand::Off,
        (ClusterKind::LevelControl, Operation::SetBrightness(level)) => {
            ClusterCommand::MoveToLevelWithOnOff {
                level,
                transition_time: 0,
            }
        }
        (ClusterKind::ColorControl, Operation::SetColor(ColorTarget::HueSaturation { hue, saturation })) => {
            if hue > MAX_HUE_SATURATION || saturation > MAX_HUE_SATURATION {
                return Err(EncodeError::InvalidParameter(format!(
                    "hue/saturation {}/{} exceeds {}",
                    hue, saturation, MAX_HUE_SATURATION
                )));
            }
            ClusterCommand::MoveToHueAndSaturation {
                hue,
                saturation,
                transition_time: 0,
            }
        }
        (ClusterKind::ColorControl, Operation::SetColor(ColorTarget::Xy { x, y })) => {
            ClusterCommand::MoveToColor {
                x: encode_color_axis(x)?,
                y: encode_color_axis(y)?,
                transition_time: 0,
            }
        }
        (cluster, op) => {
            return Err(EncodeError::Unsupported {
                cluster,
                operation: op.name(),
            })
        }
    };
    Ok(command)
}
