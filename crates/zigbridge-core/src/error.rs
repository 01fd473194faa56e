//! Unified error handling for zigbridge.
//!
//! Layer-specific errors (codec, router, registry, network, bus) live next to
//! the code that raises them and convert into this type at the bridge
//! boundary.

use std::time::Duration;

/// Unified error type for zigbridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device Network unreachable or failing.
    #[error("Network error: {0}")]
    Network(String),

    /// Message bus unreachable or failing.
    #[error("Message bus error: {0}")]
    Bus(String),

    /// Timeout errors.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Device Network initialisation did not finish in time. Always fatal.
    #[error("Startup timed out after {0:?}")]
    StartupTimeout(Duration),

    /// Validation errors.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(e.to_string())
    }
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error must take the whole bridge down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StartupTimeout(_) | Self::Network(_) | Self::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("missing broker");
        assert_eq!(err.to_string(), "Configuration error: missing broker");

        let err = Error::StartupTimeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60s"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::StartupTimeout(Duration::from_secs(1)).is_fatal());
        assert!(Error::network("radio gone").is_fatal());
        assert!(!Error::validation("bad payload").is_fatal());
        assert!(!Error::bus("publish failed").is_fatal());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
