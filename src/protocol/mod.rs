//! Wire-level vocabulary of the bridge
//!
//! Refresh command decoding, topic layout, and the JSON payloads published
//! on the data, status, error and heartbeat topics.

pub mod command;
pub mod messages;
pub mod topics;

pub use command::{
    decode, CommandDecoder, DecodeError, DecodeStrategy, RefreshCommand, StrategyOutcome,
};
pub use messages::*;
pub use topics::{normalize_prefix, Channel, TopicSet};
