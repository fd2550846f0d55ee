//! JSON payloads published by the service
//!
//! One struct per outbound message shape. All timestamps in heartbeat and
//! status messages are epoch milliseconds.

use super::command::{DecodeError, RefreshCommand};
use crate::error::sanitize_error_message;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Service name announced in heartbeats
pub const SERVICE_NAME: &str = "suez-mqtt";

/// Name of the remote data source embedded in reports
pub const DATA_SOURCE: &str = "toutsurmoneau.fr";

/// Measurement data for one refresh, published on `<prefix>/data`
///
/// # Examples
/// ```
/// use suez_mqtt::protocol::{ConsumptionReport, RefreshCommand};
/// use chrono::NaiveDate;
/// use serde_json::json;
///
/// let report = ConsumptionReport::new(
///     RefreshCommand::Daily,
///     "123456",
///     NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
///     NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
///     vec![json!({"date": "2024-01-01", "volume": 0.21})],
/// );
/// assert_eq!(report.record_count(), 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumptionReport {
    pub mode: RefreshCommand,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub meter_id: String,
    pub period: Period,
    pub data: ReportData,
}

/// Inclusive date range covered by a report
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportData {
    pub content: ReportContent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportContent {
    pub measures: Vec<Value>,
}

impl ConsumptionReport {
    pub fn new(
        mode: RefreshCommand,
        meter_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        measures: Vec<Value>,
    ) -> Self {
        Self {
            mode,
            timestamp: Utc::now(),
            source: DATA_SOURCE.to_string(),
            meter_id: meter_id.to_string(),
            period: Period { start, end },
            data: ReportData {
                content: ReportContent { measures },
            },
        }
    }

    pub fn record_count(&self) -> usize {
        self.data.content.measures.len()
    }
}

/// Machine-readable error category
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Remote service rejected the credentials
    AuthFailed,
    /// Transport, HTTP or response-shape failure while fetching
    FetchFailed,
    /// Refresh payload could not be decoded
    InvalidCommand,
}

/// Payload published on `<prefix>/error`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<RefreshCommand>,
    /// Human-readable message
    pub error: String,
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Raw refresh payload, for decode errors only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl ErrorReport {
    pub fn fetch_failure(
        mode: RefreshCommand,
        code: ErrorCode,
        message: String,
        status_code: Option<u16>,
    ) -> Self {
        Self {
            mode: Some(mode),
            error: message,
            code,
            status_code,
            payload: None,
        }
    }

    /// Report for a rejected refresh payload
    ///
    /// The payload is echoed back redacted and capped like the message.
    pub fn invalid_command(error: &DecodeError) -> Self {
        Self {
            mode: None,
            error: sanitize_error_message(&error.to_string()),
            code: ErrorCode::InvalidCommand,
            status_code: None,
            payload: Some(sanitize_error_message(error.raw())),
        }
    }
}

/// Status values published on `<prefix>/status`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// A report was published on the data topic
    Success,
    /// A refresh was rejected because another fetch is running
    Busy,
    /// The service is shutting down
    Stopped,
}

/// Payload published on `<prefix>/status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusMessage {
    pub status: StatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<RefreshCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: i64,
}

impl StatusMessage {
    pub fn success(mode: RefreshCommand, records: usize) -> Self {
        Self {
            status: StatusKind::Success,
            mode: Some(mode),
            records: Some(records),
            message: None,
            timestamp: now_millis(),
        }
    }

    pub fn busy(rejected: RefreshCommand) -> Self {
        Self {
            status: StatusKind::Busy,
            mode: Some(rejected),
            records: None,
            message: Some("fetch already in progress".to_string()),
            timestamp: now_millis(),
        }
    }

    pub fn stopped() -> Self {
        Self {
            status: StatusKind::Stopped,
            mode: None,
            records: None,
            message: Some("service shutting down".to_string()),
            timestamp: now_millis(),
        }
    }
}

/// Liveness announcement published on `<prefix>/heartbeat`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub status: String,
    pub timestamp: i64,
    pub service: String,
}

impl Heartbeat {
    pub fn alive() -> Self {
        Self {
            status: "alive".to_string(),
            timestamp: now_millis(),
            service: SERVICE_NAME.to_string(),
        }
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_heartbeat_shape() {
        let value = serde_json::to_value(Heartbeat::alive()).unwrap();
        assert_eq!(value["status"], "alive");
        assert_eq!(value["service"], "suez-mqtt");
        assert!(value["timestamp"].is_i64());
        assert!(value["timestamp"].as_i64().unwrap() > 1_600_000_000_000);
    }

    #[test]
    fn test_report_shape() {
        let report = ConsumptionReport::new(
            RefreshCommand::Monthly,
            "42",
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            vec![json!({"month": 1}), json!({"month": 2})],
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["mode"], "monthly");
        assert_eq!(value["source"], "toutsurmoneau.fr");
        assert_eq!(value["meter_id"], "42");
        assert_eq!(value["period"]["start"], "2024-01-01");
        assert_eq!(value["period"]["end"], "2024-03-31");
        assert_eq!(value["data"]["content"]["measures"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_fetch_failure_shape() {
        let report = ErrorReport::fetch_failure(
            RefreshCommand::Daily,
            ErrorCode::AuthFailed,
            "Authentication failed".to_string(),
            Some(401),
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["mode"], "daily");
        assert_eq!(value["error"], "Authentication failed");
        assert_eq!(value["code"], "auth_failed");
        assert_eq!(value["status_code"], 401);
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_invalid_command_shape() {
        let error = crate::protocol::decode(br#"{"mode":"yearly"}"#).unwrap_err();
        let value = serde_json::to_value(ErrorReport::invalid_command(&error)).unwrap();
        assert_eq!(value["code"], "invalid_command");
        assert_eq!(value["payload"], r#"{"mode":"yearly"}"#);
        assert!(value.get("mode").is_none());
        assert!(value["error"].as_str().unwrap().contains("yearly"));
    }

    #[test]
    fn test_invalid_command_redacts_secrets() {
        let error = crate::protocol::decode(b"password=hunter2").unwrap_err();
        let report = ErrorReport::invalid_command(&error);

        assert!(!report.error.contains("hunter2"), "{}", report.error);
        assert_eq!(report.payload.as_deref(), Some("password=***"));
    }

    #[test]
    fn test_invalid_command_caps_oversized_payload() {
        let payload = "x".repeat(100_000);
        let error = crate::protocol::decode(payload.as_bytes()).unwrap_err();
        let report = ErrorReport::invalid_command(&error);

        assert!(report.error.len() <= crate::error::MAX_ERROR_MESSAGE_LEN);
        let echoed = report.payload.unwrap();
        assert!(echoed.len() <= crate::error::MAX_ERROR_MESSAGE_LEN);
        assert!(echoed.ends_with("...[truncated]"));
    }

    #[test]
    fn test_busy_status_shape() {
        let value = serde_json::to_value(StatusMessage::busy(RefreshCommand::Daily)).unwrap();
        assert_eq!(value["status"], "busy");
        assert_eq!(value["mode"], "daily");
        assert!(value.get("records").is_none());
    }
}
