//! Broker link state, reconnection policy and `rumqttc` options

use crate::config::MqttSection;
use rumqttc::v5::MqttOptions;
use std::time::Duration;
use thiserror::Error;

/// State of the broker link, as published by the supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// First attempt in progress
    Connecting,
    /// CONNACK received
    Connected,
    Disconnected(String),
    /// Retry number `n` in progress
    Reconnecting(u32),
}

/// Backoff between reconnection attempts
///
/// Retries never stop; past `escalate_after` attempts each failure is
/// logged at error level instead of warn.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff pattern in milliseconds, one entry per attempt
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
    /// Attempts after which failures are escalated
    pub escalate_after: u32,
    /// How long the initial connection may take before startup fails
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![250, 500, 1000, 2000, 5000],
            sustained_delay: 10_000,
            escalate_after: 10,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Whether `attempt` is past the retry budget
    pub fn is_escalated(&self, attempt: u32) -> bool {
        attempt > self.escalate_after
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Publish failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscribe failed: {0}")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publish timed out after {0:?}")]
    PublishTimeout(Duration),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: Option<ConnectionState> },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Build `rumqttc` options from config
///
/// A fresh client id is generated per call so a reconnect never collides
/// with the broker's record of the previous session.
pub fn configure_mqtt_options(client_name: &str, config: &MqttSection) -> MqttOptions {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let client_id = format!("{client_name}-{timestamp}");
    let mut mqtt_options = MqttOptions::new(client_id, config.host.clone(), config.port);

    if let Some(username) = config.username.as_deref().filter(|u| !u.is_empty()) {
        let password = config.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(60));

    // History reports carry two years of daily measures
    mqtt_options.set_max_packet_size(Some(1024 * 1024));

    mqtt_options
}
