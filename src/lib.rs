//! Suez water-usage bridge over MQTT
//!
//! Listens for refresh commands on an MQTT topic, fetches consumption data
//! from the Suez "Tout sur mon eau" portal, and publishes the result.
//!
//! # Overview
//!
//! - [`protocol`] - Refresh command decoding, topic layout and payloads
//! - [`remote`] - The water-usage portal client and the fetch adapter
//! - [`service`] - Single-flight fetch gate, publisher and service lifecycle
//! - [`transport`] - MQTT client with supervised reconnection
//! - [`config`], [`error`], [`observability`] - Ambient concerns
//!
//! # Quick Start
//!
//! ```rust
//! use suez_mqtt::protocol::{CommandDecoder, RefreshCommand, TopicSet};
//!
//! let decoder = CommandDecoder::new();
//! assert_eq!(decoder.decode(br#"{"mode": "daily"}"#).unwrap(), RefreshCommand::Daily);
//! assert_eq!(decoder.decode(b" history\n").unwrap(), RefreshCommand::History);
//! assert!(decoder.decode(b"Daily").is_err());
//!
//! let topics = TopicSet::new("water");
//! assert_eq!(topics.refresh(), "water/refresh");
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod remote;
pub mod service;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ServiceConfig};
pub use error::{ServiceError, ServiceResult};
pub use protocol::{CommandDecoder, DecodeError, RefreshCommand, TopicSet};
pub use remote::{FetchAdapter, FetchResult, ToutSurMonEauClient, WaterUsageApi};
pub use service::{FetchSerializer, ServiceState, SuezService};
pub use transport::mqtt::MqttClient;
