//! Service configuration
//!
//! Configuration is read once at startup, either from the process environment
//! (the default) or from a TOML file, and is immutable afterwards.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Environment variable names understood by [`ServiceConfig::from_env`]
pub mod env_keys {
    pub const EMAIL: &str = "SUEZ_EMAIL";
    pub const PASSWORD: &str = "SUEZ_PASSWORD";
    pub const METER_ID: &str = "SUEZ_ID_PDS";
    pub const METER_ID_FALLBACK: &str = "ID_PDS";
    pub const VERIFY_SSL: &str = "VERIFY_SSL";
    pub const BASE_URL: &str = "SUEZ_BASE_URL";
    pub const MQTT_BROKER: &str = "MQTT_BROKER";
    pub const MQTT_PORT: &str = "MQTT_PORT";
    pub const MQTT_USERNAME: &str = "MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "MQTT_PASSWORD";
    pub const MQTT_TOPIC: &str = "MQTT_TOPIC";
    pub const HEARTBEAT_INTERVAL: &str = "HEARTBEAT_INTERVAL";
    pub const SHUTDOWN_GRACE: &str = "SHUTDOWN_GRACE";
}

/// Complete service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub account: AccountSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub service: ServiceSection,
}

/// Water utility account credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSection {
    pub email: String,
    pub password: String,
    /// Point de service identifier of the water meter
    pub meter_id: String,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

/// MQTT broker connection and topic layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Heartbeat interval in seconds (default: 60)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

/// Service loop policy knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    /// How long shutdown waits for an in-flight fetch before abandoning it
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub windows: FetchWindows,
}

/// Day counts of the three fetch windows
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchWindows {
    #[serde(default = "default_daily_days")]
    pub daily_days: u32,
    #[serde(default = "default_monthly_days")]
    pub monthly_days: u32,
    #[serde(default = "default_history_days")]
    pub history_days: u32,
}

fn default_verify_ssl() -> bool {
    true
}

fn default_base_url() -> String {
    "https://www.toutsurmoneau.fr".to_string()
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "water".to_string()
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_daily_days() -> u32 {
    30
}

fn default_monthly_days() -> u32 {
    90
}

fn default_history_days() -> u32 {
    720
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace(),
            windows: FetchWindows::default(),
        }
    }
}

impl Default for FetchWindows {
    fn default() -> Self {
        Self {
            daily_days: default_daily_days(),
            monthly_days: default_monthly_days(),
            history_days: default_history_days(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Required setting not configured: {0}")]
    Missing(String),
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ServiceConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| get(key).ok_or_else(|| ConfigError::Missing(key.to_string()));

        let meter_id = get(env_keys::METER_ID)
            .or_else(|| get(env_keys::METER_ID_FALLBACK))
            .ok_or_else(|| {
                ConfigError::Missing(format!(
                    "{} (or {})",
                    env_keys::METER_ID,
                    env_keys::METER_ID_FALLBACK
                ))
            })?;

        let account = AccountSection {
            email: required(env_keys::EMAIL)?,
            password: required(env_keys::PASSWORD)?,
            meter_id,
            verify_ssl: get(env_keys::VERIFY_SSL)
                .map(|v| parse_flag(&v))
                .unwrap_or_else(default_verify_ssl),
            base_url: get(env_keys::BASE_URL).unwrap_or_else(default_base_url),
        };

        let mqtt = MqttSection {
            host: get(env_keys::MQTT_BROKER).unwrap_or_else(default_mqtt_host),
            port: parse_number(env_keys::MQTT_PORT, get(env_keys::MQTT_PORT))?
                .unwrap_or_else(default_mqtt_port),
            username: get(env_keys::MQTT_USERNAME),
            password: get(env_keys::MQTT_PASSWORD),
            topic_prefix: get(env_keys::MQTT_TOPIC).unwrap_or_else(default_topic_prefix),
            heartbeat_interval_secs: parse_number(
                env_keys::HEARTBEAT_INTERVAL,
                get(env_keys::HEARTBEAT_INTERVAL),
            )?
            .unwrap_or_else(default_heartbeat_interval),
        };

        let service = ServiceSection {
            shutdown_grace_secs: parse_number(
                env_keys::SHUTDOWN_GRACE,
                get(env_keys::SHUTDOWN_GRACE),
            )?
            .unwrap_or_else(default_shutdown_grace),
            windows: FetchWindows::default(),
        };

        let config = ServiceConfig {
            account,
            mqtt,
            service,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServiceConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("account.email", &self.account.email),
            ("account.password", &self.account.password),
            ("account.meter_id", &self.account.meter_id),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(key.to_string()));
            }
        }

        if self.mqtt.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "heartbeat interval must be at least one second".to_string(),
            ));
        }

        if self.mqtt.topic_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::InvalidConfig(
                "topic prefix must not be empty".to_string(),
            ));
        }

        let windows = &self.service.windows;
        if windows.daily_days == 0 || windows.monthly_days == 0 || windows.history_days == 0 {
            return Err(ConfigError::InvalidConfig(
                "fetch windows must span at least one day".to_string(),
            ));
        }

        Ok(())
    }

    /// Copy of the configuration with every secret masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.account.password = "***".to_string();
        if copy.mqtt.password.is_some() {
            copy.mqtt.password = Some("***".to_string());
        }
        copy
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            account: AccountSection {
                email: "user@example.com".to_string(),
                password: "hunter2".to_string(),
                meter_id: "123456789".to_string(),
                verify_ssl: true,
                base_url: default_base_url(),
            },
            mqtt: MqttSection::default(),
            service: ServiceSection::default(),
        }
    }
}

/// Truthy values are `true`, `1` and `yes`, case-insensitively
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_number<N: std::str::FromStr>(
    key: &str,
    value: Option<String>,
) -> Result<Option<N>, ConfigError> {
    value
        .map(|v| {
            v.trim().parse::<N>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: v.clone(),
            })
        })
        .transpose()
}
