//! Broker link policy: when to retry, what state an event leads to
//!
//! Everything here is free of I/O so the supervisor's decisions can be
//! tested without a broker.

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{info, warn};

/// Reconnection and state-transition rules for the broker link
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to attempt another reconnection (pure function)
    ///
    /// Only a shutdown request stops the retries.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
            escalated: config.is_escalated(attempt),
        }
    }

    /// State the link moves to after `event`
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
        }
    }

    /// Publishing is only attempted on an acknowledged connection
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Subscribing has the same requirement as publishing
    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log a link state change at a level matching its severity
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Connected to MQTT broker");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(%reason, "Lost connection to MQTT broker");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt, "Reconnection successful");
            }
            _ => {
                tracing::debug!(target: "mqtt_transport", "MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Reject policies that would spin without delay or never time out
    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.sustained_delay == 0 {
            return Err("sustained delay must be at least 1ms".to_string());
        }

        if config.backoff_pattern.iter().any(|&delay| delay == 0) {
            return Err("backoff_pattern entries must be greater than 0".to_string());
        }

        if config.connect_timeout.is_zero() {
            return Err("connect_timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// What the supervisor should do after losing the link
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay_ms`, then try again
    Proceed {
        attempt: u32,
        delay_ms: u64,
        /// Past the retry budget; still retrying, but loudly
        escalated: bool,
    },
    /// The client is being shut down; stop retrying
    AbortShutdownRequested,
}

/// Event-loop observations that change the link state
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Broker acknowledged the session
    ConnAckReceived,
    /// Broker sent DISCONNECT
    DisconnectedByBroker,
    /// Event loop failed with an I/O or protocol error
    NetworkError(String),
    /// Supervisor is about to retry
    ReconnectionStarted(u32),
}
