//! Bus payloads: outgoing JSON documents and validation of inbound commands.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;
use zigbridge_core::{iso_timestamp, Capability, DeviceAnnouncement, Ieee, Nwk, OnOffState};

use crate::codec::{ColorTarget, Operation, MAX_HUE_SATURATION};
use crate::network::NetworkInfo;
use crate::registry::DeviceRecord;

/// Error validating an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> PayloadError {
    PayloadError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, PayloadError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(PayloadError::Malformed(format!(
            "expected a JSON object, got {}",
            other
        ))),
        Err(e) => Err(PayloadError::Malformed(e.to_string())),
    }
}

fn bounded_int(map: &Map<String, Value>, field: &'static str, max: u64) -> Result<Option<u64>, PayloadError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_u64() {
            Some(n) if n <= max => Ok(Some(n)),
            _ => Err(invalid(field, format!("expected an integer in 0..={}, got {}", max, value))),
        },
    }
}

fn unit_float(map: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, PayloadError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_f64() {
            Some(v) if (0.0..=1.0).contains(&v) => Ok(Some(v)),
            _ => Err(invalid(field, format!("expected a number in [0, 1], got {}", value))),
        },
    }
}

/// Validate a `set` payload and turn it into an operation for `capability`.
pub fn parse_command(capability: Capability, payload: &[u8]) -> Result<Operation, PayloadError> {
    let map = parse_object(payload)?;
    match capability {
        Capability::Switch | Capability::Light => {
            let state = map
                .get("state")
                .ok_or(PayloadError::MissingField("state"))?
                .as_str()
                .ok_or_else(|| invalid("state", "expected a string"))?;
            let state: OnOffState = state.parse().map_err(|e: String| invalid("state", e))?;
            Ok(Operation::SetState(state))
        }
        Capability::Brightness => {
            let level = bounded_int(&map, "brightness", 255)?
                .ok_or(PayloadError::MissingField("brightness"))?;
            Ok(Operation::SetBrightness(level as u8))
        }
        Capability::Color => parse_color(&map).map(Operation::SetColor),
        other => Err(PayloadError::Malformed(format!(
            "capability {} does not accept commands",
            other
        ))),
    }
}

/// x/y wins when both are present; otherwise hue/saturation, each defaulting to 0.
fn parse_color(map: &Map<String, Value>) -> Result<ColorTarget, PayloadError> {
    let x = unit_float(map, "x")?;
    let y = unit_float(map, "y")?;
    let hue = bounded_int(map, "hue", MAX_HUE_SATURATION as u64)?;
    let saturation = bounded_int(map, "saturation", MAX_HUE_SATURATION as u64)?;

    match (x, y, hue, saturation) {
        (Some(x), Some(y), _, _) => Ok(ColorTarget::Xy { x, y }),
        (None, None, None, None) => Err(PayloadError::MissingField("hue|saturation|x|y")),
        (Some(_), None, None, None) => Err(PayloadError::MissingField("y")),
        (None, Some(_), None, None) => Err(PayloadError::MissingField("x")),
        (_, _, hue, saturation) => Ok(ColorTarget::HueSaturation {
            hue: hue.unwrap_or(0) as u8,
            saturation: saturation.unwrap_or(0) as u8,
        }),
    }
}

/// Validate a permit-join payload: `{"permit_join": bool}`.
pub fn parse_permit_join(payload: &[u8]) -> Result<bool, PayloadError> {
    let map = parse_object(payload)?;
    map.get("permit_join")
        .ok_or(PayloadError::MissingField("permit_join"))?
        .as_bool()
        .ok_or_else(|| invalid("permit_join", "expected a boolean"))
}

fn hex16(value: u16) -> String {
    format!("0x{:04x}", value)
}

/// Retained coordinator status.
pub fn coordinator_status(
    status: &str,
    network: Option<&NetworkInfo>,
    devices: &[DeviceRecord],
    now: DateTime<Utc>,
) -> Value {
    let mut message = json!({
        "status": status,
        "timestamp": iso_timestamp(&now),
    });
    if let (Some(info), Value::Object(map)) = (network, &mut message) {
        let children: Vec<Value> = devices
            .iter()
            .filter(|d| !d.is_coordinator)
            .map(|d| {
                json!({
                    "ieee": d.ieee.to_string(),
                    "nwk": d.nwk.to_string(),
                    "manufacturer": d.manufacturer,
                    "model": d.model,
                })
            })
            .collect();
        map.insert("channel".into(), json!(info.channel));
        map.insert("pan_id".into(), json!(info.pan_id));
        map.insert("extended_pan_id".into(), json!(info.extended_pan_id.to_string()));
        map.insert("children_count".into(), json!(children.len()));
        if !children.is_empty() {
            map.insert("children".into(), Value::Array(children));
        }
    }
    message
}

/// Non-retained `device_joined` notification.
pub fn device_joined(announcement: &DeviceAnnouncement) -> Value {
    let mut map = Map::new();
    map.insert("event".into(), json!("device_joined"));
    map.insert("ieee".into(), json!(announcement.ieee.to_string()));
    map.insert("nwk".into(), json!(announcement.nwk.0));
    map.insert("manufacturer".into(), json!(announcement.manufacturer));
    map.insert("model".into(), json!(announcement.model));
    map.insert("timestamp".into(), json!(iso_timestamp(&announcement.timestamp)));

    if !announcement.endpoints.is_empty() {
        let endpoints: Map<String, Value> = announcement
            .endpoints
            .values()
            .map(|ep| {
                (
                    ep.id.to_string(),
                    json!({
                        "profile_id": hex16(ep.profile_id),
                        "device_type": hex16(ep.device_type),
                        "in_clusters": ep.in_clusters.iter().map(|c| hex16(*c)).collect::<Vec<_>>(),
                        "out_clusters": ep.out_clusters.iter().map(|c| hex16(*c)).collect::<Vec<_>>(),
                    }),
                )
            })
            .collect();
        map.insert("endpoints".into(), Value::Object(endpoints));
    }

    if let Some(node) = &announcement.node {
        map.insert(
            "device_type".into(),
            json!({
                "is_coordinator": node.is_coordinator,
                "is_router": node.is_router,
                "is_end_device": node.is_end_device,
                "is_full_function_device": node.is_full_function_device,
                "manufacturer_code": node.manufacturer_code.map(hex16),
            }),
        );
    }

    if !announcement.capabilities.is_empty() {
        let capabilities: Map<String, Value> = announcement
            .capabilities
            .iter()
            .map(|cap| (cap.as_str().to_string(), Value::Bool(true)))
            .collect();
        map.insert("capabilities".into(), Value::Object(capabilities));
    }
    Value::Object(map)
}

/// Retained per-device status published on join.
pub fn device_status(announcement: &DeviceAnnouncement) -> Value {
    json!({
        "ieee": announcement.ieee.to_string(),
        "nwk": announcement.nwk.0,
        "manufacturer": announcement.manufacturer,
        "model": announcement.model,
        "status": "joined",
        "timestamp": iso_timestamp(&announcement.timestamp),
    })
}

/// Non-retained `device_left` notification.
pub fn device_left(ieee: Ieee, nwk: Nwk, timestamp: DateTime<Utc>) -> Value {
    json!({
        "event": "device_left",
        "ieee": ieee.to_string(),
        "nwk": nwk.0,
        "timestamp": iso_timestamp(&timestamp),
    })
}

/// Retained permit-join status.
pub fn permit_join_status(seconds: u64, now: DateTime<Utc>) -> Value {
    json!({
        "status": if seconds > 0 { "enabled" } else { "disabled" },
        "time": seconds,
        "timestamp": iso_timestamp(&now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use zigbridge_core::{EndpointDescriptor, NodeDescriptor};

    #[test]
    fn test_switch_payloads() {
        assert_eq!(
            parse_command(Capability::Switch, br#"{"state":"ON"}"#).unwrap(),
            Operation::SetState(OnOffState::On)
        );
        assert_eq!(
            parse_command(Capability::Light, br#"{"state":"off"}"#).unwrap(),
            Operation::SetState(OnOffState::Off)
        );
        assert_eq!(
            parse_command(Capability::Switch, br#"{}"#),
            Err(PayloadError::MissingField("state"))
        );
        assert!(matches!(
            parse_command(Capability::Switch, br#"{"state":"toggle"}"#),
            Err(PayloadError::InvalidValue { field: "state", .. })
        ));
        assert!(matches!(
            parse_command(Capability::Switch, b"on"),
            Err(PayloadError::Malformed(_))
        ));
        assert!(matches!(
            parse_command(Capability::Switch, b"[1,2]"),
            Err(PayloadError::Malformed(_))
        ));
    }

    #[test]
    fn test_brightness_range() {
        assert_eq!(
            parse_command(Capability::Brightness, br#"{"brightness":255}"#).unwrap(),
            Operation::SetBrightness(255)
        );
        assert!(parse_command(Capability::Brightness, br#"{"brightness":256}"#).is_err());
        assert!(parse_command(Capability::Brightness, br#"{"brightness":-1}"#).is_err());
        assert!(parse_command(Capability::Brightness, br#"{"brightness":"high"}"#).is_err());
    }

    #[test]
    fn test_color_selection() {
        assert_eq!(
            parse_command(Capability::Color, br#"{"x":0.3,"y":0.4,"hue":10}"#).unwrap(),
            Operation::SetColor(ColorTarget::Xy { x: 0.3, y: 0.4 })
        );
        assert_eq!(
            parse_command(Capability::Color, br#"{"hue":120}"#).unwrap(),
            Operation::SetColor(ColorTarget::HueSaturation {
                hue: 120,
                saturation: 0
            })
        );
        assert_eq!(
            parse_command(Capability::Color, br#"{}"#),
            Err(PayloadError::MissingField("hue|saturation|x|y"))
        );
        assert_eq!(
            parse_command(Capability::Color, br#"{"x":0.2}"#),
            Err(PayloadError::MissingField("y"))
        );
        assert!(parse_command(Capability::Color, br#"{"x":1.2,"y":0.1}"#).is_err());
        assert!(parse_command(Capability::Color, br#"{"saturation":255}"#).is_err());
    }

    #[test]
    fn test_permit_join_payload() {
        assert!(parse_permit_join(br#"{"permit_join":true}"#).unwrap());
        assert!(!parse_permit_join(br#"{"permit_join":false}"#).unwrap());
        assert!(parse_permit_join(br#"{"permit_join":"yes"}"#).is_err());
        assert!(parse_permit_join(br#"{}"#).is_err());
    }

    #[test]
    fn test_device_joined_detail() {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(
            1,
            EndpointDescriptor::new(1, vec![0x0000, 0x0006])
                .with_device_type(0x0100)
                .with_out_clusters(vec![0x0019]),
        );
        let announcement = DeviceAnnouncement {
            ieee: Ieee::from_u64(0xabc),
            nwk: Nwk(0x1234),
            manufacturer: Some("Acme".into()),
            model: None,
            endpoints,
            node: Some(NodeDescriptor {
                is_router: true,
                manufacturer_code: Some(0x117c),
                ..Default::default()
            }),
            capabilities: BTreeSet::from([Capability::Switch]),
            timestamp: Utc::now(),
        };

        let message = device_joined(&announcement);
        assert_eq!(message["event"], "device_joined");
        assert_eq!(message["nwk"], 0x1234);
        assert_eq!(message["model"], Value::Null);
        assert_eq!(message["endpoints"]["1"]["profile_id"], "0x0104");
        assert_eq!(message["endpoints"]["1"]["device_type"], "0x0100");
        assert_eq!(message["endpoints"]["1"]["in_clusters"], json!(["0x0000", "0x0006"]));
        assert_eq!(message["endpoints"]["1"]["out_clusters"], json!(["0x0019"]));
        assert_eq!(message["device_type"]["manufacturer_code"], "0x117c");
        assert_eq!(message["capabilities"]["switch"], true);

        let status = device_status(&announcement);
        assert_eq!(status["status"], "joined");
    }

    #[test]
    fn test_device_joined_without_endpoints() {
        let announcement = DeviceAnnouncement {
            ieee: Ieee::from_u64(1),
            nwk: Nwk(1),
            manufacturer: None,
            model: None,
            endpoints: BTreeMap::new(),
            node: None,
            capabilities: BTreeSet::new(),
            timestamp: Utc::now(),
        };
        let message = device_joined(&announcement);
        assert!(message.get("endpoints").is_none());
        assert!(message.get("capabilities").is_none());
        assert!(message.get("device_type").is_none());
    }

    #[test]
    fn test_coordinator_status_shapes() {
        let now = Utc::now();
        let offline = coordinator_status("offline", None, &[], now);
        assert_eq!(offline.as_object().unwrap().len(), 2);

        let info = NetworkInfo {
            channel: 15,
            pan_id: 0x1a62,
            extended_pan_id: Ieee::from_u64(0xdd),
        };
        let online = coordinator_status("online", Some(&info), &[], now);
        assert_eq!(online["channel"], 15);
        assert_eq!(online["children_count"], 0);
        assert!(online.get("children").is_none());
    }

    #[test]
    fn test_permit_join_status() {
        let now = Utc::now();
        assert_eq!(permit_join_status(120, now)["status"], "enabled");
        assert_eq!(permit_join_status(0, now)["status"], "disabled");
        assert_eq!(permit_join_status(0, now)["time"], 0);
    }
}
