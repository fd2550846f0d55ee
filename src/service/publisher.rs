//! Outbound payloads onto their topics
//!
//! Serializes protocol messages to JSON and hands them to the transport with
//! the QoS and retain flag of their channel.

use crate::protocol::{Channel, StatusMessage, TopicSet};
use crate::remote::FetchResult;
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn, Instrument};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to serialize payload for {topic}: {source}")]
    Serialize {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to publish on {topic}: {source}")]
    Transport {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Typed publishing on top of a shared transport
pub struct Publisher<T: Transport> {
    transport: Arc<T>,
    topics: TopicSet,
}

impl<T: Transport> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            topics: self.topics.clone(),
        }
    }
}

impl<T: Transport + 'static> Publisher<T> {
    pub fn new(transport: Arc<T>, topics: TopicSet) -> Self {
        Self { transport, topics }
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    /// Publish `message` on `channel`
    pub async fn publish<M: Serialize>(
        &self,
        channel: Channel,
        message: &M,
    ) -> Result<(), PublishError> {
        let topic = self.topics.channel(channel);
        let payload = serde_json::to_vec(message).map_err(|source| PublishError::Serialize {
            topic: topic.clone(),
            source,
        })?;

        let span = crate::mqtt_span!(topic = %topic);
        debug!(topic = %topic, bytes = payload.len(), "Publishing");

        self.transport
            .publish(&topic, payload, channel.qos(), channel.retain())
            .instrument(span)
            .await
            .map_err(|e| PublishError::Transport {
                topic,
                source: Box::new(e),
            })
    }

    /// Report a finished fetch
    ///
    /// Success goes to `/data` followed by a success status; failure goes to
    /// `/error`. The status is skipped if the data publish failed.
    pub async fn publish_fetch_result(&self, result: &FetchResult) -> Result<(), PublishError> {
        match result {
            FetchResult::Success(report) => {
                self.publish(Channel::Data, report).await?;
                let status = StatusMessage::success(report.mode, report.record_count());
                if let Err(e) = self.publish(Channel::Status, &status).await {
                    warn!(mode = %report.mode, error = %e, "Data published but success status was not");
                    return Err(e);
                }
                Ok(())
            }
            FetchResult::Failure(failure) => {
                self.publish(Channel::Error, &failure.to_error_report()).await
            }
        }
    }
}
