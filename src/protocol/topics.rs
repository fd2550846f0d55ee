//! Topic layout under the configured prefix
//!
//! All topics hang off a single prefix (default `water`): `<prefix>/refresh`,
//! `<prefix>/data`, `<prefix>/status`, `<prefix>/error` and `<prefix>/heartbeat`.

use rumqttc::v5::mqttbytes::QoS;

/// Outbound topic kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Data,
    Status,
    Error,
    Heartbeat,
}

impl Channel {
    pub fn suffix(&self) -> &'static str {
        match self {
            Channel::Data => "data",
            Channel::Status => "status",
            Channel::Error => "error",
            Channel::Heartbeat => "heartbeat",
        }
    }

    /// Every outbound message is delivered at least once
    pub fn qos(&self) -> QoS {
        QoS::AtLeastOnce
    }

    /// Errors are transient, everything else keeps the last value on the broker
    pub fn retain(&self) -> bool {
        !matches!(self, Channel::Error)
    }
}

/// Trim every level, drop empty levels and rejoin with single slashes
pub fn normalize_prefix(prefix: &str) -> String {
    prefix
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Fully-qualified topics for one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    prefix: String,
}

impl TopicSet {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: normalize_prefix(prefix),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn refresh(&self) -> String {
        format!("{}/refresh", self.prefix)
    }

    pub fn channel(&self, channel: Channel) -> String {
        format!("{}/{}", self.prefix, channel.suffix())
    }

    pub fn data(&self) -> String {
        self.channel(Channel::Data)
    }

    pub fn status(&self) -> String {
        self.channel(Channel::Status)
    }

    pub fn error(&self) -> String {
        self.channel(Channel::Error)
    }

    pub fn heartbeat(&self) -> String {
        self.channel(Channel::Heartbeat)
    }
}
