//! The bridge itself
//!
//! - [`serializer`] - Single-flight gate in front of the remote service
//! - [`publisher`] - Typed publishing onto the outbound topics
//! - [`lifecycle`] - Startup, the heartbeat and dispatcher tasks, shutdown

pub mod lifecycle;
pub mod publisher;
pub mod serializer;

pub use lifecycle::{ServiceState, SuezService};
pub use publisher::{PublishError, Publisher};
pub use serializer::{FetchBusy, FetchSerializer, PendingFetch};
