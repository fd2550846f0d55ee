//! Classifying event-loop output and delivering refresh messages
//!
//! [`MessageHandler`] decides, without side effects, what each `rumqttc`
//! event means for the supervisor and which inbound publishes are passed on.
//! [`MessageForwarder`] hands the accepted ones to the service loop.

use crate::transport::InboundMessage;
use rumqttc::v5::Event;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Stateless event classification and inbound filtering
pub struct MessageHandler;

impl MessageHandler {
    /// Whether an inbound publish reaches the service loop
    ///
    /// Retained messages are ignored: a retained refresh would replay a
    /// fetch on every reconnect.
    pub fn should_process_message(topic: &str, retain: bool, subscribed: &[String]) -> bool {
        if retain {
            debug!(topic, "Dropping retained message");
            return false;
        }

        if !subscribed.iter().any(|t| t == topic) {
            debug!(topic, "Dropping message on a topic we never subscribed to");
            return false;
        }

        true
    }

    /// Classify one event-loop event
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    },
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// What an event-loop event means for the supervisor
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// CONNACK: the session is usable
    ConnectionAcknowledged,
    /// Inbound PUBLISH
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// Broker sent DISCONNECT
    Disconnected,
    /// SUBACK
    SubscriptionConfirmed { packet_id: u16 },
    /// Keepalive and acknowledgement traffic
    InfrastructureEvent(String),
    /// Our own outbound packets
    OutgoingEvent,
}

/// Hands inbound messages to whoever registered a sender
#[derive(Default)]
pub struct MessageForwarder {
    sender: Mutex<Option<mpsc::Sender<InboundMessage>>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        let mut slot = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(sender);
    }

    /// Forward a message to the registered channel
    pub async fn forward(&self, message: InboundMessage) -> Result<(), String> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        match sender {
            Some(sender) => sender
                .send(message)
                .await
                .map_err(|e| format!("Failed to forward message: {e}")),
            None => {
                warn!(topic = %message.topic, "No receiver registered, dropping inbound message");
                Err("no receiver registered".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::Publish;
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_should_process_message() {
        let subscribed = vec!["water/refresh".to_string()];

        assert!(MessageHandler::should_process_message(
            "water/refresh",
            false,
            &subscribed
        ));

        // Retained refresh commands are ignored
        assert!(!MessageHandler::should_process_message(
            "water/refresh",
            true,
            &subscribed
        ));

        assert!(!MessageHandler::should_process_message(
            "water/data",
            false,
            &subscribed
        ));
    }

    #[test]
    fn test_route_mqtt_event() {
        use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Disconnect, Packet};

        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: rumqttc::v5::mqttbytes::v5::DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));

        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("water/refresh"),
            pkid: 1,
            payload: Bytes::from("daily"),
            properties: None,
        }));

        if let EventRoute::MessageReceived {
            topic,
            payload,
            retain,
        } = MessageHandler::route_mqtt_event(&publish)
        {
            assert_eq!(topic, "water/refresh");
            assert_eq!(payload, b"daily");
            assert!(retain);
        } else {
            panic!("Expected MessageReceived route");
        }
    }

    #[tokio::test]
    async fn test_message_forwarder() {
        let forwarder = MessageForwarder::new();
        let message = InboundMessage {
            topic: "water/refresh".to_string(),
            payload: b"{\"mode\":\"daily\"}".to_vec(),
            retain: false,
        };

        // Nothing registered yet
        assert!(forwarder.forward(message.clone()).await.is_err());

        let (tx, mut rx) = mpsc::channel(1);
        forwarder.set_sender(tx);

        assert!(forwarder.forward(message.clone()).await.is_ok());
        assert_eq!(rx.recv().await, Some(message));
    }

    #[tokio::test]
    async fn test_message_forwarder_closed_receiver() {
        let forwarder = MessageForwarder::new();
        let (tx, rx) = mpsc::channel(1);
        forwarder.set_sender(tx);
        drop(rx);

        let message = InboundMessage {
            topic: "water/refresh".to_string(),
            payload: b"daily".to_vec(),
            retain: false,
        };
        assert!(forwarder.forward(message).await.is_err());
    }
}
