//! Topic Router.
//!
//! Bidirectional mapping between broker topics and bridge routes. Every topic
//! the bridge publishes or subscribes to is produced here, and [`TopicRouter::parse`]
//! accepts exactly the shapes [`TopicRouter::topic`] produces.
//!
//! Layout, below the configured base topic (`zigbee` by default):
//!
//! ```text
//! coordinator/status
//! permit_join
//! permit_join/status
//! device/joined
//! device/left
//! device/{ieee}/status
//! device/{ieee}/{capability path}/state
//! device/{ieee}/{capability path}/set
//! ```

use std::fmt;
use thiserror::Error;
use zigbridge_core::{AddressParseError, Capability, Ieee};

/// Error type for topic parsing and building.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic {0:?} is outside the bridge base topic")]
    ForeignPrefix(String),

    #[error("unrecognized topic {0:?}")]
    Unrecognized(String),

    #[error(transparent)]
    InvalidAddress(#[from] AddressParseError),

    #[error("capability {0} does not accept commands")]
    NotCommandable(Capability),

    #[error("direction {0} is not device/capability scoped")]
    NotCapabilityScoped(Direction),
}

/// Message direction relative to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device state, bridge to bus.
    State,
    /// Command, bus to bridge.
    Set,
    Status,
    Joined,
    Left,
    PermitJoin,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Set => "set",
            Self::Status => "status",
            Self::Joined => "joined",
            Self::Left => "left",
            Self::PermitJoin => "permit_join",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed (or to-be-built) bridge topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    DeviceState { ieee: Ieee, capability: Capability },
    DeviceSet { ieee: Ieee, capability: Capability },
    DeviceStatus { ieee: Ieee },
    CoordinatorStatus,
    Joined,
    Left,
    PermitJoin,
    PermitJoinStatus,
}

impl Route {
    pub fn direction(&self) -> Direction {
        match self {
            Self::DeviceState { .. } => Direction::State,
            Self::DeviceSet { .. } => Direction::Set,
            Self::DeviceStatus { .. } | Self::CoordinatorStatus | Self::PermitJoinStatus => {
                Direction::Status
            }
            Self::Joined => Direction::Joined,
            Self::Left => Direction::Left,
            Self::PermitJoin => Direction::PermitJoin,
        }
    }

    pub fn ieee(&self) -> Option<Ieee> {
        match self {
            Self::DeviceState { ieee, .. }
            | Self::DeviceSet { ieee, .. }
            | Self::DeviceStatus { ieee } => Some(*ieee),
            _ => None,
        }
    }

    pub fn capability(&self) -> Option<Capability> {
        match self {
            Self::DeviceState { capability, .. } | Self::DeviceSet { capability, .. } => {
                Some(*capability)
            }
            _ => None,
        }
    }
}

/// Builds and parses bridge topics under one base topic.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    base: String,
}

impl TopicRouter {
    pub fn new(base: impl Into<String>) -> Self {
        let base: String = base.into();
        Self {
            base: base.trim_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Topic for a device capability in the given direction.
    pub fn topic_for(
        &self,
        ieee: Ieee,
        capability: Capability,
        direction: Direction,
    ) -> Result<String, TopicError> {
        let route = match direction {
            Direction::State => Route::DeviceState { ieee, capability },
            Direction::Set if capability.is_commandable() => Route::DeviceSet { ieee, capability },
            Direction::Set => return Err(TopicError::NotCommandable(capability)),
            other => return Err(TopicError::NotCapabilityScoped(other)),
        };
        Ok(self.topic(&route))
    }

    /// Render a route as a topic string.
    pub fn topic(&self, route: &Route) -> String {
        let base = &self.base;
        match route {
            Route::DeviceState { ieee, capability } => {
                format!("{}/device/{}/{}/state", base, ieee, capability.topic_path())
            }
            Route::DeviceSet { ieee, capability } => {
                format!("{}/device/{}/{}/set", base, ieee, capability.topic_path())
            }
            Route::DeviceStatus { ieee } => format!("{}/device/{}/status", base, ieee),
            Route::CoordinatorStatus => format!("{}/coordinator/status", base),
            Route::Joined => format!("{}/device/joined", base),
            Route::Left => format!("{}/device/left", base),
            Route::PermitJoin => format!("{}/permit_join", base),
            Route::PermitJoinStatus => format!("{}/permit_join/status", base),
        }
    }

    /// Parse a topic back into a route.
    pub fn parse(&self, topic: &str) -> Result<Route, TopicError> {
        let unrecognized = || TopicError::Unrecognized(topic.to_string());

        let rest = topic
            .strip_prefix(self.base.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| TopicError::ForeignPrefix(topic.to_string()))?;

        match rest {
            "coordinator/status" => return Ok(Route::CoordinatorStatus),
            "permit_join" => return Ok(Route::PermitJoin),
            "permit_join/status" => return Ok(Route::PermitJoinStatus),
            "device/joined" => return Ok(Route::Joined),
            "device/left" => return Ok(Route::Left),
            _ => {}
        }

        let device = rest.strip_prefix("device/").ok_or_else(unrecognized)?;
        let (address, tail) = device.split_once('/').ok_or_else(unrecognized)?;
        let ieee: Ieee = address.parse()?;

        if tail == "status" {
            return Ok(Route::DeviceStatus { ieee });
        }

        let (path, direction) = tail.rsplit_once('/').ok_or_else(unrecognized)?;
        let capability = Capability::from_topic_path(path).ok_or_else(unrecognized)?;
        match direction {
            "state" => Ok(Route::DeviceState { ieee, capability }),
            "set" if capability.is_commandable() => Ok(Route::DeviceSet { ieee, capability }),
            "set" => Err(TopicError::NotCommandable(capability)),
            _ => Err(unrecognized()),
        }
    }

    /// Topic filters the bridge subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut filters = vec![self.topic(&Route::PermitJoin)];
        filters.extend(
            Capability::ALL
                .into_iter()
                .filter(|cap| cap.is_commandable())
                .map(|cap| format!("{}/device/+/{}/set", self.base, cap.topic_path())),
        );
        filters
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new("zigbee")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Ieee {
        "00:0d:6f:00:0a:bc:de:f0".parse().unwrap()
    }

    #[test]
    fn test_state_topics() {
        let router = TopicRouter::default();
        assert_eq!(
            router
                .topic_for(addr(), Capability::Brightness, Direction::State)
                .unwrap(),
            "zigbee/device/00:0d:6f:00:0a:bc:de:f0/light/brightness/state"
        );
        assert_eq!(
            router.topic(&Route::DeviceStatus { ieee: addr() }),
            "zigbee/device/00:0d:6f:00:0a:bc:de:f0/status"
        );
    }

    #[test]
    fn test_parse_reverses_topic_for() {
        let router = TopicRouter::default();
        for ieee in [addr(), Ieee::from_u64(0), Ieee::from_u64(u64::MAX)] {
            for capability in Capability::ALL {
                let topic = router.topic_for(ieee, capability, Direction::State).unwrap();
                assert_eq!(
                    router.parse(&topic).unwrap(),
                    Route::DeviceState { ieee, capability }
                );
                if capability.is_commandable() {
                    let topic = router.topic_for(ieee, capability, Direction::Set).unwrap();
                    assert_eq!(router.parse(&topic).unwrap(), Route::DeviceSet { ieee, capability });
                }
            }
        }
    }

    #[test]
    fn test_fixed_routes_round_trip() {
        let router = TopicRouter::new("home/zigbee/");
        for route in [
            Route::CoordinatorStatus,
            Route::Joined,
            Route::Left,
            Route::PermitJoin,
            Route::PermitJoinStatus,
            Route::DeviceStatus { ieee: addr() },
        ] {
            let topic = router.topic(&route);
            assert!(topic.starts_with("home/zigbee/"));
            assert_eq!(router.parse(&topic).unwrap(), route);
        }
    }

    #[test]
    fn test_parse_rejects_foreign_and_malformed() {
        let router = TopicRouter::default();
        assert!(matches!(
            router.parse("other/device/joined"),
            Err(TopicError::ForeignPrefix(_))
        ));
        assert!(matches!(router.parse("zigbeex/permit_join"), Err(TopicError::ForeignPrefix(_))));
        assert!(matches!(
            router.parse("zigbee/device/not-an-address/switch/set"),
            Err(TopicError::InvalidAddress(_))
        ));
        assert!(matches!(
            router.parse("zigbee/device/00:0d:6f:00:0a:bc:de:f0/thermostat/set"),
            Err(TopicError::Unrecognized(_))
        ));
        assert!(matches!(
            router.parse("zigbee/device/00:0d:6f:00:0a:bc:de:f0/switch/toggle"),
            Err(TopicError::Unrecognized(_))
        ));
        assert!(matches!(
            router.parse("zigbee/device/+/switch/set"),
            Err(TopicError::InvalidAddress(_))
        ));
        assert!(matches!(router.parse("zigbee/"), Err(TopicError::Unrecognized(_))));
    }

    #[test]
    fn test_sensor_set_is_rejected() {
        let router = TopicRouter::default();
        assert_eq!(
            router.parse("zigbee/device/00:0d:6f:00:0a:bc:de:f0/temperature/set"),
            Err(TopicError::NotCommandable(Capability::Temperature))
        );
        assert!(router
            .topic_for(addr(), Capability::IasZone, Direction::Set)
            .is_err());
        assert!(router
            .topic_for(addr(), Capability::Switch, Direction::Joined)
            .is_err());
    }

    #[test]
    fn test_subscriptions() {
        let filters = TopicRouter::default().subscriptions();
        assert_eq!(
            filters,
            vec![
                "zigbee/permit_join",
                "zigbee/device/+/switch/set",
                "zigbee/device/+/light/set",
                "zigbee/device/+/light/brightness/set",
                "zigbee/device/+/light/color/set",
            ]
        );
    }
}
