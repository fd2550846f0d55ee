//! Refresh command decoding
//!
//! A refresh payload is decoded by trying an ordered list of strategies.
//! Each strategy either produces a verdict or declares itself not applicable,
//! and the first verdict wins. Decoding is pure and performs no I/O.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Data window requested by a refresh message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshCommand {
    Daily,
    Monthly,
    History,
}

impl RefreshCommand {
    pub const ALL: [RefreshCommand; 3] = [
        RefreshCommand::Daily,
        RefreshCommand::Monthly,
        RefreshCommand::History,
    ];

    /// Wire literal of the command
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshCommand::Daily => "daily",
            RefreshCommand::Monthly => "monthly",
            RefreshCommand::History => "history",
        }
    }
}

impl fmt::Display for RefreshCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefreshCommand {
    type Err = DecodeError;

    /// Exact, case-sensitive match against the three literals
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(RefreshCommand::Daily),
            "monthly" => Ok(RefreshCommand::Monthly),
            "history" => Ok(RefreshCommand::History),
            other => Err(DecodeError::UnknownMode {
                raw: other.to_string(),
            }),
        }
    }
}

/// Rejected refresh payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown refresh mode: {raw:?}")]
    UnknownMode { raw: String },
    #[error("JSON refresh payload has no string \"mode\" field: {raw}")]
    MissingMode { raw: String },
    #[error("refresh payload is not valid UTF-8")]
    InvalidUtf8 { raw: String },
    #[error("empty refresh payload")]
    Empty,
}

impl DecodeError {
    /// Offending payload text, as received
    pub fn raw(&self) -> &str {
        match self {
            DecodeError::UnknownMode { raw }
            | DecodeError::MissingMode { raw }
            | DecodeError::InvalidUtf8 { raw } => raw,
            DecodeError::Empty => "",
        }
    }

    /// Same error, carrying `text` as the offending payload
    fn with_raw(self, text: &str) -> Self {
        let raw = text.to_string();
        match self {
            DecodeError::UnknownMode { .. } => DecodeError::UnknownMode { raw },
            DecodeError::MissingMode { .. } => DecodeError::MissingMode { raw },
            other => other,
        }
    }
}

/// Outcome of a single decode strategy
#[derive(Debug, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// The payload has this strategy's shape and was decoded (or rejected)
    Decoded(Result<RefreshCommand, DecodeError>),
    /// The payload does not have this strategy's shape
    NotApplicable,
}

/// One way of reading a refresh payload
pub trait DecodeStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn try_decode(&self, text: &str) -> StrategyOutcome;
}

/// `{"mode": "daily"}`
pub struct JsonModeStrategy;

impl DecodeStrategy for JsonModeStrategy {
    fn name(&self) -> &'static str {
        "json"
    }

    fn try_decode(&self, text: &str) -> StrategyOutcome {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => return StrategyOutcome::NotApplicable,
        };

        // A bare JSON string such as "daily" is left to the plain-text reading
        let Some(object) = value.as_object() else {
            return match value {
                serde_json::Value::String(_) => StrategyOutcome::NotApplicable,
                _ => StrategyOutcome::Decoded(Err(DecodeError::MissingMode {
                    raw: text.to_string(),
                })),
            };
        };

        let decoded = match object.get("mode").and_then(|m| m.as_str()) {
            Some(mode) => mode.parse::<RefreshCommand>(),
            None => Err(DecodeError::MissingMode {
                raw: text.to_string(),
            }),
        };
        StrategyOutcome::Decoded(decoded)
    }
}

/// `daily`, surrounding whitespace ignored
pub struct PlainTextStrategy;

impl DecodeStrategy for PlainTextStrategy {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn try_decode(&self, text: &str) -> StrategyOutcome {
        StrategyOutcome::Decoded(text.trim().parse::<RefreshCommand>())
    }
}

/// Ordered strategy list applied to inbound refresh payloads
pub struct CommandDecoder {
    strategies: Vec<Box<dyn DecodeStrategy>>,
}

impl CommandDecoder {
    /// JSON first, then plain text
    pub fn new() -> Self {
        Self::with_strategies(vec![Box::new(JsonModeStrategy), Box::new(PlainTextStrategy)])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn DecodeStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Decode raw payload bytes into a refresh command
    pub fn decode(&self, raw: &[u8]) -> Result<RefreshCommand, DecodeError> {
        let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8 {
            raw: String::from_utf8_lossy(raw).into_owned(),
        })?;

        if text.trim().is_empty() {
            return Err(DecodeError::Empty);
        }

        for strategy in &self.strategies {
            // Strategies may report only the part they inspected
            if let StrategyOutcome::Decoded(result) = strategy.try_decode(text) {
                return result.map_err(|e| e.with_raw(text));
            }
        }

        Err(DecodeError::UnknownMode {
            raw: text.to_string(),
        })
    }
}

impl Default for CommandDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode with the default strategy order
pub fn decode(raw: &[u8]) -> Result<RefreshCommand, DecodeError> {
    CommandDecoder::new().decode(raw)
}
