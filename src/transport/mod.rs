//! Transport layer for the bridge
//!
//! This module provides the publish/subscribe abstraction the service loop
//! talks to, and its MQTT implementation.

use rumqttc::v5::mqttbytes::QoS;
use tokio::sync::mpsc;

pub mod mqtt;

pub use mqtt::ConnectionState;

/// Message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Transport trait for broker communication
///
/// Shared between the heartbeat task and the command dispatcher, so every
/// operation after `connect` takes `&self`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker, resolving once the connection is acknowledged
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Disconnect from the broker and stop reconnecting
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Publish a payload; fails fast while not connected
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error>;

    /// Subscribe to a topic; the subscription survives reconnects
    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state, `None` before `connect`
    fn connection_state(&self) -> Option<ConnectionState>;

    /// Set the channel receiving messages from subscribed topics
    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>);
}
