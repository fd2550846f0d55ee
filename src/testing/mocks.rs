//! Mock implementations for testing
//!
//! Provides a mock `Transport` and a spy `WaterUsageApi` so the service loop
//! can be exercised without a broker or the remote portal.

use crate::remote::{Granularity, RemoteError, WaterUsageApi};
use crate::transport::mqtt::{ConnectionState, MessageHandler, MqttError};
use crate::transport::{InboundMessage, Transport};
use async_trait::async_trait;
use chrono::NaiveDate;
use rumqttc::v5::mqttbytes::QoS;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// One recorded publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    /// Payload parsed as JSON, if it is JSON
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Mock transport for testing
#[derive(Debug, Default)]
pub struct MockTransport {
    pub published: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<String>>>,
    pub should_fail_connect: bool,
    pub should_fail_publish: bool,
    connected: AtomicBool,
    ever_connected: AtomicBool,
    disconnect_calls: AtomicUsize,
    message_sender: std::sync::Mutex<Option<mpsc::Sender<InboundMessage>>>,
    slow_topic: Option<(String, Duration)>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose `connect` fails, like an unreachable broker
    pub fn with_connect_failure() -> Self {
        Self {
            should_fail_connect: true,
            ..Default::default()
        }
    }

    pub fn with_publish_failure() -> Self {
        Self {
            should_fail_publish: true,
            ..Default::default()
        }
    }

    /// Hold every publish on `topic` for `delay` before it reaches the broker
    pub fn with_slow_topic(mut self, topic: &str, delay: Duration) -> Self {
        self.slow_topic = Some((topic.to_string(), delay));
        self
    }

    /// Simulate a dropped or restored broker connection
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub async fn get_published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    /// Publishes on `topic`, in order
    pub async fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
    }

    /// Deliver a message as if the broker had sent it
    ///
    /// Applies the same filtering as the MQTT client. Returns whether the
    /// message reached the registered receiver.
    pub async fn inject(&self, topic: &str, payload: &[u8], retain: bool) -> bool {
        let subscriptions = self.subscriptions.lock().await.clone();
        if !MessageHandler::should_process_message(topic, retain, &subscriptions) {
            return false;
        }

        let sender = self
            .message_sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        match sender {
            Some(sender) => sender
                .send(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    retain,
                })
                .await
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.should_fail_connect {
            return Err(MqttError::ConnectionFailedStr(
                "Mock connection failure".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.ever_connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error> {
        if let Some((slow, delay)) = &self.slow_topic {
            if slow == topic {
                tokio::time::sleep(*delay).await;
            }
        }
        if !self.is_connected() {
            return Err(MqttError::NotConnected {
                state: self.connection_state(),
            });
        }
        if self.should_fail_publish {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }

        self.published.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected {
                state: self.connection_state(),
            });
        }
        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.iter().any(|t| t == topic) {
            subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        if !self.ever_connected.load(Ordering::SeqCst) {
            None
        } else if self.is_connected() {
            Some(ConnectionState::Connected)
        } else {
            Some(ConnectionState::Disconnected("Mock disconnect".to_string()))
        }
    }

    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        *self
            .message_sender
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(sender);
    }
}

/// Spy water-usage API with scripted behaviour
#[derive(Debug)]
pub struct MockWaterApi {
    meter_id: String,
    measures: usize,
    delay: Duration,
    auth_failure: Option<RemoteError>,
    telemetry_failure: Option<RemoteError>,
    remaining_failures: AtomicUsize,
    auth_calls: AtomicUsize,
    telemetry_calls: AtomicUsize,
    requests: std::sync::Mutex<Vec<(Granularity, NaiveDate, NaiveDate)>>,
}

impl Default for MockWaterApi {
    fn default() -> Self {
        Self {
            meter_id: "123456789".to_string(),
            measures: 5,
            delay: Duration::ZERO,
            auth_failure: None,
            telemetry_failure: None,
            remaining_failures: AtomicUsize::new(0),
            auth_calls: AtomicUsize::new(0),
            telemetry_calls: AtomicUsize::new(0),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl MockWaterApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of measures returned per telemetry call
    pub fn with_measures(mut self, count: usize) -> Self {
        self.measures = count;
        self
    }

    /// Delay each telemetry call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reject every authentication
    pub fn with_auth_failure(mut self) -> Self {
        self.auth_failure = Some(RemoteError::Authentication {
            message: "invalid credentials".to_string(),
            status: Some(401),
        });
        self
    }

    /// Fail the first `times` telemetry calls with `error`
    pub fn failing_first(mut self, times: usize, error: RemoteError) -> Self {
        self.telemetry_failure = Some(error);
        self.remaining_failures = AtomicUsize::new(times);
        self
    }

    /// Fail every telemetry call with `error`
    pub fn always_failing(self, error: RemoteError) -> Self {
        self.failing_first(usize::MAX, error)
    }

    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn telemetry_calls(&self) -> usize {
        self.telemetry_calls.load(Ordering::SeqCst)
    }

    /// Every call into the API, authentication included
    pub fn total_calls(&self) -> usize {
        self.auth_calls() + self.telemetry_calls()
    }

    pub fn requests(&self) -> Vec<(Granularity, NaiveDate, NaiveDate)> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn take_failure(&self) -> Option<RemoteError> {
        let error = self.telemetry_failure.as_ref()?;
        self.remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| error.clone())
    }
}

#[async_trait]
impl WaterUsageApi for MockWaterApi {
    fn name(&self) -> &str {
        "mock"
    }

    fn meter_id(&self) -> &str {
        &self.meter_id
    }

    async fn authenticate(&self) -> Result<(), RemoteError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        match &self.auth_failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn telemetry(
        &self,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Value>, RemoteError> {
        self.telemetry_calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((granularity, start, end));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        Ok((0..self.measures)
            .map(|i| {
                json!({
                    "date": start.to_string(),
                    "index": i,
                    "volume": 0.1 * i as f64,
                })
            })
            .collect())
    }
}
