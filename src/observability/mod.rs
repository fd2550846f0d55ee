//! Observability for the bridge
//!
//! Structured logging through `tracing`, configured from the environment,
//! plus span macros for fetches, MQTT operations and lifecycle events.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{fetch_span, lifecycle_span, mqtt_span};
