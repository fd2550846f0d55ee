//! Top-level error type and error-message hygiene
//!
//! Component errors (`ConfigError`, `DecodeError`, `FetchBusy`, `RemoteError`,
//! `MqttError`) live next to their components. Only configuration errors and
//! the initial broker connection are fatal; everything else is reported on MQTT.

use crate::remote::RemoteError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length of an error message published on MQTT
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Errors that can stop the service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Broker connection error: {0}")]
    BrokerConnection(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Remote service error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Invalid lifecycle transition: {message}")]
    Lifecycle { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ServiceError {
    pub fn broker<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::BrokerConnection(Box::new(error))
    }

    pub fn lifecycle<S: Into<String>>(message: S) -> Self {
        Self::Lifecycle {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the process should exit on this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServiceError::Config(_) | ServiceError::BrokerConnection(_)
        )
    }
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("valid secret regex")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("valid path regex")
});

/// Redact credentials and sensitive paths, cap the length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
