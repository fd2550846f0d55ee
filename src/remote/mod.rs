//! Remote water-usage service
//!
//! [`WaterUsageApi`] is the narrow contract the bridge needs from the utility's
//! web service: authenticate, then read telemetry for a date range.
//! [`FetchAdapter`] turns a refresh command into calls against that contract
//! and never lets an error escape: every attempt yields a [`FetchResult`].

pub mod adapter;
pub mod toutsurmoneau;

pub use adapter::{month_chunks, FetchAdapter, FetchFailure, FetchResult};
pub use toutsurmoneau::{ToutSurMonEauClient, ToutSurMonEauConfig};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Aggregation level of a telemetry request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Daily,
    Monthly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures reported by the remote service client
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    #[error("Authentication failed: {message}")]
    Authentication {
        message: String,
        status: Option<u16>,
    },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Remote API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
    #[error("Client not configured: {0}")]
    NotConfigured(String),
}

impl RemoteError {
    /// HTTP status reported by the remote side, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RemoteError::Authentication { status, .. } => *status,
            RemoteError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, RemoteError::Authentication { .. })
    }
}

/// Contract of the external water-usage service
#[async_trait]
pub trait WaterUsageApi: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Meter the client reads from
    fn meter_id(&self) -> &str;

    /// Open an authenticated session
    async fn authenticate(&self) -> Result<(), RemoteError>;

    /// Measures between `start` and `end`, both inclusive
    async fn telemetry(
        &self,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Value>, RemoteError>;
}
