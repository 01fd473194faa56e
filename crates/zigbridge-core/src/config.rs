//! Bridge configuration.
//!
//! Configuration sources, lowest priority first:
//! 1. built-in defaults
//! 2. a TOML file (`--config`, or `zigbridge.toml` in the working directory)
//! 3. environment variables (see [`env_vars`])

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};
use crate::types::{EndpointDescriptor, Ieee};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "zigbridge.toml";

/// Environment variable names.
pub mod env_vars {
    pub const MQTT_HOST: &str = "ZIGBRIDGE_MQTT_HOST";
    pub const MQTT_PORT: &str = "ZIGBRIDGE_MQTT_PORT";
    pub const MQTT_USERNAME: &str = "ZIGBRIDGE_MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "ZIGBRIDGE_MQTT_PASSWORD";
    pub const BASE_TOPIC: &str = "ZIGBRIDGE_BASE_TOPIC";
    pub const LOG_JSON: &str = "ZIGBRIDGE_LOG_JSON";
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub simulator: SimulatorConfig,
}

/// Message bus (MQTT broker) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Client ID (auto-generated if not provided)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// QoS applied uniformly to every publish and subscription.
    pub qos: u8,
    /// First topic segment of every bridge topic.
    pub base_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 60,
            qos: 1,
            base_topic: "zigbee".to_string(),
        }
    }
}

impl MqttConfig {
    pub fn full_broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Device Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Device Network implementation. Only `simulator` is built in.
    pub backend: String,
    pub device_path: String,
    pub baudrate: u32,
    pub channel: u8,
    pub database: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            backend: "simulator".to_string(),
            device_path: "/dev/ttyACM0".to_string(),
            baudrate: 115_200,
            channel: 15,
            database: "zigbee.db".to_string(),
        }
    }
}

/// Timeouts, retry budgets and polling intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub command_timeout_secs: u64,
    pub command_attempts: u32,
    pub retry_delay_secs: u64,
    pub startup_timeout_secs: u64,
    pub startup_attempts: u32,
    pub startup_retry_delay_secs: u64,
    pub join_poll_attempts: u32,
    pub join_poll_backoff_ms: u64,
    pub refresh_min_secs: u64,
    pub refresh_max_secs: u64,
    pub permit_join_secs: u64,
    pub permit_join_retry_delay_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 30,
            command_attempts: 3,
            retry_delay_secs: 2,
            startup_timeout_secs: 60,
            startup_attempts: 3,
            startup_retry_delay_secs: 2,
            join_poll_attempts: 3,
            join_poll_backoff_ms: 1000,
            refresh_min_secs: 30,
            refresh_max_secs: 45,
            permit_join_secs: 120,
            permit_join_retry_delay_secs: 1,
            shutdown_timeout_secs: 10,
        }
    }
}

impl TimingConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn startup_retry_delay(&self) -> Duration {
        Duration::from_secs(self.startup_retry_delay_secs)
    }

    pub fn join_poll_backoff(&self) -> Duration {
        Duration::from_millis(self.join_poll_backoff_ms)
    }

    pub fn refresh_range(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.refresh_min_secs),
            Duration::from_secs(self.refresh_max_secs),
        )
    }

    pub fn permit_join_duration(&self) -> Duration {
        Duration::from_secs(self.permit_join_secs)
    }

    pub fn permit_join_retry_delay(&self) -> Duration {
        Duration::from_secs(self.permit_join_retry_delay_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Devices seeded into the simulated Device Network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub devices: Vec<SimulatedDeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedDeviceConfig {
    pub ieee: Ieee,
    pub nwk: u16,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
}

impl BridgeConfig {
    /// Load configuration: defaults, then the TOML file, then the environment.
    ///
    /// An explicit `path` must exist; without one, [`DEFAULT_CONFIG_FILE`] is
    /// used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                info!("Loading config from: {}", path.display());
                Self::from_toml(&std::fs::read_to_string(path)?)?
            }
            None => match std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
                Ok(content) => {
                    info!("Loading config from: {}", DEFAULT_CONFIG_FILE);
                    Self::from_toml(&content)?
                }
                Err(_) => {
                    info!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(env_vars::MQTT_HOST) {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup(env_vars::MQTT_PORT) {
            self.mqtt.port = port
                .parse()
                .map_err(|_| Error::config(format!("{} is not a port: {}", env_vars::MQTT_PORT, port)))?;
        }
        if let Some(username) = lookup(env_vars::MQTT_USERNAME) {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup(env_vars::MQTT_PASSWORD) {
            self.mqtt.password = Some(password);
        }
        if let Some(base) = lookup(env_vars::BASE_TOPIC) {
            self.mqtt.base_topic = base;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.qos > 2 {
            return Err(Error::config(format!("mqtt.qos must be 0..=2, got {}", self.mqtt.qos)));
        }
        let base = self.mqtt.base_topic.trim_matches('/');
        if base.is_empty() || base.contains(['+', '#']) {
            return Err(Error::config("mqtt.base_topic must be a non-empty literal topic"));
        }
        let timing = &self.timing;
        if timing.command_attempts == 0 || timing.startup_attempts == 0 {
            return Err(Error::config("retry attempt counts must be at least 1"));
        }
        if timing.join_poll_attempts == 0 {
            return Err(Error::config("timing.join_poll_attempts must be at least 1"));
        }
        if timing.refresh_min_secs == 0 || timing.refresh_min_secs > timing.refresh_max_secs {
            return Err(Error::config(format!(
                "invalid refresh interval {}..{}",
                timing.refresh_min_secs, timing.refresh_max_secs
            )));
        }
        if self.network.backend != "simulator" {
            return Err(Error::config(format!(
                "unsupported network backend: {}",
                self.network.backend
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.mqtt.full_broker_addr(), "localhost:1883");
        assert_eq!(config.mqtt.qos, 1);
        assert_eq!(config.timing.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.timing.command_attempts, 3);
        assert_eq!(config.timing.startup_timeout(), Duration::from_secs(60));
        assert_eq!(
            config.timing.refresh_range(),
            (Duration::from_secs(30), Duration::from_secs(45))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = BridgeConfig::from_toml(
            r#"
            [mqtt]
            host = "broker.lan"
            qos = 0

            [timing]
            command_timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.qos, 0);
        assert_eq!(config.timing.command_timeout_secs, 5);
        assert_eq!(config.timing.retry_delay_secs, 2);
    }

    #[test]
    fn test_simulator_devices_toml() {
        let config = BridgeConfig::from_toml(
            r#"
            [[simulator.devices]]
            ieee = "00:0d:6f:00:0a:bc:de:f0"
            nwk = 4660
            model = "plug"

            [[simulator.devices.endpoints]]
            id = 1
            in_clusters = [0, 6]
            "#,
        )
        .unwrap();
        let device = &config.simulator.devices[0];
        assert_eq!(device.ieee, "00:0d:6f:00:0a:bc:de:f0".parse().unwrap());
        assert_eq!(device.endpoints[0].in_clusters, vec![0, 6]);
        assert_eq!(device.endpoints[0].profile_id, 0x0104);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (env_vars::MQTT_HOST, "10.0.0.2"),
            (env_vars::MQTT_PORT, "8883"),
            (env_vars::BASE_TOPIC, "mesh"),
        ]
        .into_iter()
        .collect();

        let mut config = BridgeConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.base_topic, "mesh");
    }

    #[test]
    fn test_env_bad_port() {
        let mut config = BridgeConfig::default();
        let result = config.apply_env(|key| (key == env_vars::MQTT_PORT).then(|| "abc".to_string()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = BridgeConfig::default();
        config.mqtt.qos = 3;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.timing.refresh_min_secs = 50;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.timing.command_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.mqtt.base_topic = "zigbee/#".to_string();
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.network.backend = "ezsp".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let text = BridgeConfig::default().to_toml().unwrap();
        let parsed = BridgeConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.mqtt.base_topic, "zigbee");
        assert_eq!(parsed.timing.permit_join_secs, 120);
    }
}
