//! Coordinator configuration
//!
//! Serializable to/from JSON. Every load and save path runs `validate()`.

use crate::gatt::{TARGET_CHARACTERISTIC_UUID, TARGET_SERVICE_UUID};
use crate::reconnect::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// The service/characteristic pair defining the application protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolIds {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
}

impl Default for ProtocolIds {
    fn default() -> Self {
        Self {
            service_uuid: TARGET_SERVICE_UUID,
            characteristic_uuid: TARGET_CHARACTERISTIC_UUID,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitiatorConfig {
    /// Keep scanning even when asked to stop (background safety)
    pub always_scanning: bool,
    /// Connect to peers advertising the protocol service as soon as they are seen
    pub auto_connect: bool,
    /// Enable notifications on the protocol characteristic once discovered
    pub auto_subscribe: bool,
    pub dedupe_ttl_ms: u64,
    pub transient_error_ttl_ms: u64,
    pub write_verify_attempts: u32,
    pub write_verify_interval_ms: u64,
    pub reconnect: ReconnectPolicy,
    /// Unset leaves connection attempts unbounded
    pub connect_timeout_ms: Option<u64>,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            always_scanning: false,
            auto_connect: true,
            auto_subscribe: true,
            dedupe_ttl_ms: 180_000,
            transient_error_ttl_ms: 2_000,
            write_verify_attempts: 10,
            write_verify_interval_ms: 1_000,
            reconnect: ReconnectPolicy::default(),
            connect_timeout_ms: None,
        }
    }
}

impl InitiatorConfig {
    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_millis(self.dedupe_ttl_ms)
    }

    pub fn transient_error_ttl(&self) -> Duration {
        Duration::from_millis(self.transient_error_ttl_ms)
    }

    pub fn write_verify_interval(&self) -> Duration {
        Duration::from_millis(self.write_verify_interval_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dedupe_ttl_ms == 0 {
            return Err(ConfigError::Invalid("dedupe_ttl_ms must be > 0".to_string()));
        }
        if self.transient_error_ttl_ms == 0 {
            return Err(ConfigError::Invalid(
                "transient_error_ttl_ms must be > 0".to_string(),
            ));
        }
        if self.write_verify_attempts == 0 {
            return Err(ConfigError::Invalid(
                "write_verify_attempts must be >= 1".to_string(),
            ));
        }
        if self.connect_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be > 0 when set".to_string(),
            ));
        }
        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "reconnect.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay_ms cannot exceed max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// Local name included in advertisements
    pub local_name: Option<String>,
    /// Payload bound used when no subscriber reports its own
    pub default_max_update_len: usize,
    /// Pushed values retained per characteristic
    pub value_history_limit: usize,
    pub transient_error_ttl_ms: u64,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            local_name: Some("nearlink".to_string()),
            default_max_update_len: 512,
            value_history_limit: 32,
            transient_error_ttl_ms: 2_000,
        }
    }
}

impl ResponderConfig {
    pub fn transient_error_ttl(&self) -> Duration {
        Duration::from_millis(self.transient_error_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_update_len == 0 {
            return Err(ConfigError::Invalid(
                "default_max_update_len must be > 0".to_string(),
            ));
        }
        if self.value_history_limit == 0 {
            return Err(ConfigError::Invalid(
                "value_history_limit must be >= 1".to_string(),
            ));
        }
        if self.transient_error_ttl_ms == 0 {
            return Err(ConfigError::Invalid(
                "transient_error_ttl_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete configuration for both coordinator roles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NearlinkConfig {
    pub protocol: ProtocolIds,
    pub initiator: InitiatorConfig,
    pub responder: ResponderConfig,
}

impl NearlinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.service_uuid.is_nil() || self.protocol.characteristic_uuid.is_nil() {
            return Err(ConfigError::Invalid(
                "protocol UUIDs cannot be nil".to_string(),
            ));
        }
        if self.protocol.service_uuid == self.protocol.characteristic_uuid {
            return Err(ConfigError::Invalid(
                "protocol service and characteristic UUIDs must differ".to_string(),
            ));
        }
        self.initiator.validate()?;
        self.responder.validate()
    }

    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = self.to_json_string()?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        self.validate()?;
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: NearlinkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = NearlinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.initiator.write_verify_attempts, 10);
        assert_eq!(config.initiator.dedupe_ttl(), Duration::from_secs(180));
        assert_eq!(config.initiator.transient_error_ttl(), Duration::from_secs(2));
        assert_eq!(config.responder.default_max_update_len, 512);
        assert!(config.initiator.connect_timeout().is_none());
    }

    #[test]
    fn test_nil_protocol_rejected() {
        let mut config = NearlinkConfig::default();
        config.protocol.service_uuid = Uuid::nil();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identical_protocol_ids_rejected() {
        let mut config = NearlinkConfig::default();
        config.protocol.characteristic_uuid = config.protocol.service_uuid;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_verify_attempts_rejected() {
        let mut config = NearlinkConfig::default();
        config.initiator.write_verify_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_shape_validated() {
        let mut config = NearlinkConfig::default();
        config.initiator.reconnect.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = NearlinkConfig::default();
        config.initiator.reconnect.initial_delay_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_responder_bounds_validated() {
        let mut config = NearlinkConfig::default();
        config.responder.default_max_update_len = 0;
        assert!(config.validate().is_err());

        let mut config = NearlinkConfig::default();
        config.responder.value_history_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config =
            NearlinkConfig::from_json_str(r#"{ "initiator": { "always_scanning": true } }"#)
                .expect("partial config");
        assert!(config.initiator.always_scanning);
        assert_eq!(config.initiator.write_verify_attempts, 10);
        assert_eq!(config.protocol, ProtocolIds::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nearlink.json");

        let mut config = NearlinkConfig::default();
        config.initiator.connect_timeout_ms = Some(15_000);
        config.save(&path).expect("save");

        let loaded = NearlinkConfig::load(&path).expect("load");
        assert_eq!(loaded, config);
        assert_eq!(loaded.initiator.connect_timeout(), Some(Duration::from_secs(15)));
    }
}
