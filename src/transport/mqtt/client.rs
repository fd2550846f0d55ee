//! Impure I/O operations for MQTT client
//!
//! This module handles network communication, async coordination, and
//! integration with the rumqttc client. A supervisor task owns the event
//! loop: it routes events, forwards inbound messages, and rebuilds the
//! connection with backoff whenever it drops.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::MqttSection;
use crate::transport::{InboundMessage, Transport};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const SUPERVISOR_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// MQTT transport client
pub struct MqttClient {
    client_name: String,
    config: MqttSection,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: std::sync::Mutex<Option<EventLoop>>,
    event_loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Arc<Mutex<Vec<String>>>, // Re-subscribed on every ConnAck
    message_forwarder: Arc<MessageForwarder>,
}

impl MqttClient {
    pub fn new(client_name: &str, config: MqttSection) -> Self {
        let mqtt_options = configure_mqtt_options(client_name, &config);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        MqttClient {
            client_name: client_name.to_string(),
            config,
            client: Arc::new(Mutex::new(client)),
            event_loop: std::sync::Mutex::new(Some(event_loop)),
            event_loop_handle: std::sync::Mutex::new(None),
            state_rx: None,
            state_tx: None,
            shutdown_tx: None,
            reconnect_config: ReconnectConfig::default(),
            subscribed_topics: Arc::new(Mutex::new(Vec::new())),
            message_forwarder: Arc::new(MessageForwarder::new()),
        }
    }

    /// Replace the reconnection policy
    pub fn with_reconnect_config(mut self, config: ReconnectConfig) -> Result<Self, MqttError> {
        HealthMonitor::validate_connection_config(&config).map_err(MqttError::ConnectionFailedStr)?;
        self.reconnect_config = config;
        Ok(self)
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    ///
    /// Any state other than `Connected` after `Connecting` means the first
    /// connection attempt failed.
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let settled = tokio::time::timeout(timeout, async {
            state_rx
                .wait_for(|state| !matches!(state, ConnectionState::Connecting))
                .await
                .map(|state| (*state).clone())
        })
        .await;

        match settled {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(Ok(ConnectionState::Disconnected(reason))) => {
                Err(MqttError::ConnectionFailedStr(reason))
            }
            Ok(Ok(state)) => Err(MqttError::ConnectionFailedStr(format!(
                "Connection lost before acknowledgement: {state:?}"
            ))),
            Ok(Err(_)) => Err(MqttError::ConnectionFailedStr(
                "State channel closed".to_string(),
            )),
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Connect to the broker
    ///
    /// Resolves on ConnAck. If the first attempt fails the supervisor is
    /// stopped and the error returned; reconnection only applies once a
    /// connection has been established.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                MqttError::ConnectionFailedStr("Event loop already started".to_string())
            })?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.state_rx = Some(state_rx.clone());
        self.state_tx = Some(state_tx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = Supervisor {
            client_name: self.client_name.clone(),
            config: self.config.clone(),
            reconnect_config: self.reconnect_config.clone(),
            shared_client: self.client.clone(),
            subscribed_topics: self.subscribed_topics.clone(),
            forwarder: self.message_forwarder.clone(),
            state_tx,
            shutdown_rx,
            reconnect_attempts: 0,
        };
        let handle = tokio::spawn(supervisor.run(event_loop));
        *self
            .event_loop_handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(host = %self.config.host, port = self.config.port, "Connecting to MQTT broker");

        if let Err(e) =
            Self::wait_for_connection_confirmation(state_rx, self.reconnect_config.connect_timeout)
                .await
        {
            error!(host = %self.config.host, port = self.config.port, error = %e, "Initial MQTT connection failed");
            if let Some(shutdown_tx) = &self.shutdown_tx {
                let _ = shutdown_tx.send(true);
            }
            self.stop_supervisor().await;
            return Err(e);
        }

        Ok(())
    }

    /// Wait for the supervisor to exit, aborting it if it does not
    async fn stop_supervisor(&self) {
        let handle = self
            .event_loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(mut handle) = handle else {
            return;
        };

        match tokio::time::timeout(SUPERVISOR_STOP_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => {
                info!("Event loop task shut down gracefully");
            }
            Ok(Err(e)) if !e.is_cancelled() => {
                warn!("Event loop task ended with error: {}", e);
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                handle.abort();
            }
        }
    }

    /// Disconnect from the broker
    ///
    /// The supervisor flushes queued requests (including the disconnect
    /// itself) for a short while before it stops.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let client = self.client.lock().await.clone();
        if let Err(e) = client.disconnect().await {
            debug!(target: "mqtt_transport", "Disconnect request not queued: {}", e);
        }

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
            info!("Sent shutdown signal to reconnection supervisor");
        }

        if let Some(state_tx) = &self.state_tx {
            state_tx.send_replace(ConnectionState::Disconnected(
                "Client disconnected".to_string(),
            ));
        }

        self.stop_supervisor().await;

        info!("MQTT client disconnected");
        Ok(())
    }

    /// Get current connection state
    /// Returns None if connection hasn't been established yet
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Check connection state before operations
    fn check_connection_state(&self, allowed: fn(&ConnectionState) -> bool) -> Result<(), MqttError> {
        match self.connection_state() {
            Some(state) if allowed(&state) => Ok(()),
            state => Err(MqttError::NotConnected { state }),
        }
    }

    /// Publish a payload, failing fast while disconnected
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.check_connection_state(HealthMonitor::can_publish)?;

        let client = self.client.lock().await.clone();
        tokio::time::timeout(
            PUBLISH_TIMEOUT,
            client.publish(topic, qos, retain, payload),
        )
        .await
        .map_err(|_| MqttError::PublishTimeout(PUBLISH_TIMEOUT))?
        .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(target: "mqtt_transport", topic, retain, "Published message");
        Ok(())
    }

    /// Subscribe to a topic and remember it for re-subscription
    pub async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.check_connection_state(HealthMonitor::can_subscribe)?;

        info!("Subscribing to topic: {}", topic);

        let client = self.client.lock().await.clone();
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                MqttError::SubscriptionFailed(format!("Failed to subscribe to {topic}: {e}").into())
            })?;

        let mut topics = self.subscribed_topics.lock().await;
        if !topics.iter().any(|t| t == topic) {
            topics.push(topic.to_string());
        }

        info!("Successfully subscribed to: {}", topic);
        Ok(())
    }
}

/// Owner of the event loop once connected
struct Supervisor {
    client_name: String,
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    shared_client: Arc<Mutex<AsyncClient>>,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    forwarder: Arc<MessageForwarder>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_attempts: u32,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!(
            host = %self.config.host,
            port = self.config.port,
            "Starting MQTT event loop with reconnection supervisor"
        );

        loop {
            let polled = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconnection supervisor");
                        Self::drain(&mut event_loop).await;
                        break;
                    }
                    continue;
                }
                polled = event_loop.poll() => polled,
            };

            let keep_running = match polled {
                Ok(event) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    self.process_event_route(route, &mut event_loop).await
                }
                Err(e) => {
                    self.transition(ConnectionEvent::NetworkError(e.to_string()));
                    error!("MQTT event loop error: {}", e);
                    self.reconnect(&mut event_loop).await
                }
            };

            if !keep_running {
                break;
            }
        }

        info!("MQTT event loop stopped");
    }

    /// Let queued publishes and the disconnect request reach the broker
    async fn drain(event_loop: &mut EventLoop) {
        let _ = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
            while event_loop.poll().await.is_ok() {}
        })
        .await;
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = self.state_tx.send_replace(next.clone());
        HealthMonitor::log_state_transition(&previous, &next);
    }

    /// Process routed MQTT event
    /// Returns true to continue loop, false to break
    async fn process_event_route(&mut self, route: EventRoute, event_loop: &mut EventLoop) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(ConnectionEvent::ConnAckReceived);
                self.reconnect_attempts = 0;
                self.resubscribe_to_topics().await;
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                self.handle_message_received(topic, payload, retain).await;
                true
            }
            EventRoute::Disconnected => {
                self.transition(ConnectionEvent::DisconnectedByBroker);
                self.reconnect(event_loop).await
            }
            EventRoute::SubscriptionConfirmed { packet_id } => {
                debug!(target: "mqtt_transport", "Subscription confirmed: {}", packet_id);
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_message_received(&self, topic: String, payload: Vec<u8>, retain: bool) {
        debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);

        let subscribed = self.subscribed_topics.lock().await.clone();
        if !MessageHandler::should_process_message(&topic, retain, &subscribed) {
            return;
        }

        let message = InboundMessage {
            topic,
            payload,
            retain,
        };
        if let Err(e) = self.forwarder.forward(message).await {
            error!("Failed to forward inbound message: {}", e);
        }
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Swap in a fresh client and event loop
    async fn apply_new_connection(&self, event_loop: &mut EventLoop) {
        let options = configure_mqtt_options(&self.client_name, &self.config);
        let (new_client, new_event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        *event_loop = new_event_loop;

        // Publishers pick up the new client on their next call
        *self.shared_client.lock().await = new_client;
        debug!(target: "mqtt_transport", "Created new connection for reconnection attempt");
    }

    async fn resubscribe_to_topics(&self) {
        let topics = self.subscribed_topics.lock().await.clone();
        let client = self.shared_client.lock().await.clone();
        for topic in &topics {
            if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            } else {
                info!("Re-subscribed to: {}", topic);
            }
        }
    }

    /// Returns true when a new connection is in place, false on shutdown
    async fn reconnect(&mut self, event_loop: &mut EventLoop) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed {
                attempt,
                delay_ms,
                escalated,
            } => {
                self.reconnect_attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));

                if escalated {
                    error!(
                        attempt,
                        delay_ms,
                        budget = self.reconnect_config.escalate_after,
                        "MQTT broker still unreachable, retrying"
                    );
                } else {
                    warn!(attempt, delay_ms, "Attempting reconnection");
                }

                if !Self::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    return false;
                }

                if *self.shutdown_rx.borrow() {
                    info!("Shutdown signal received, aborting reconnection");
                    return false;
                }

                self.apply_new_connection(event_loop).await;
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, qos, retain).await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, topic).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        self.message_forwarder.set_sender(sender);
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        if let Some(handle) = self
            .event_loop_handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
