//! Testing utilities and mock implementations
//!
//! Mocks for exercising the service loop without an MQTT broker or the
//! remote water-usage portal.

pub mod mocks;

pub use mocks::*;
