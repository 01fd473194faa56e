//! Loading configuration from files on disk.

use std::io::Write;
use zigbridge_core::{BridgeConfig, Error};

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[mqtt]
port = 1884
base_topic = "zigbee"

[timing]
refresh_min_secs = 10
refresh_max_secs = 12
"#
    )
    .unwrap();

    let config = BridgeConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.mqtt.port, 1884);
    assert_eq!(config.timing.refresh_min_secs, 10);
    assert_eq!(config.timing.refresh_max_secs, 12);
}

#[test]
fn test_load_missing_explicit_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let result = BridgeConfig::load(Some(&dir.path().join("absent.toml")));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_load_rejects_invalid_values() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[mqtt]\nqos = 7").unwrap();

    let result = BridgeConfig::load(Some(file.path()));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_load_rejects_malformed_toml() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[mqtt\nport = ").unwrap();

    assert!(BridgeConfig::load(Some(file.path())).is_err());
}
