//! MQTT client for the bridge
//!
//! The client is split into focused sub-modules that separate pure decision
//! logic from I/O:
//!
//! - [`connection`] - Connection state, options and reconnection policy
//! - [`message_handler`] - Event routing and inbound message forwarding
//! - [`health_monitor`] - Reconnection decisions and state transitions
//! - [`client`] - The `rumqttc` client and its reconnection supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use suez_mqtt::config::MqttSection;
//! use suez_mqtt::transport::mqtt::MqttClient;
//! use suez_mqtt::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let mut client = MqttClient::new("suez-mqtt", MqttSection::default());
//! client.connect().await?;
//! client.subscribe("water/refresh").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
