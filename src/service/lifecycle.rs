//! Service lifecycle: Starting → Running → ShuttingDown → Stopped
//!
//! While running, two independent tasks share the publisher: the heartbeat
//! timer and the command dispatcher. The dispatcher never awaits a fetch; an
//! accepted fetch runs in its own task so neither the heartbeat nor the
//! acceptance of the next command waits on the remote service.

use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle_span;
use crate::protocol::{
    now_millis, Channel, CommandDecoder, ErrorReport, Heartbeat, StatusMessage, TopicSet,
};
use crate::remote::{FetchAdapter, WaterUsageApi};
use crate::service::publisher::Publisher;
use crate::service::serializer::FetchSerializer;
use crate::transport::{InboundMessage, Transport};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

/// Inbound refresh messages buffered between the transport and the dispatcher
const INBOUND_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::ShuttingDown => "shutting_down",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Fetch tasks, including ones still publishing after releasing the gate
type FetchTasks = Arc<Mutex<JoinSet<()>>>;

/// The MQTT ↔ water-usage bridge
pub struct SuezService<T: Transport + 'static> {
    config: ServiceConfig,
    topics: TopicSet,
    decoder: Arc<CommandDecoder>,
    serializer: FetchSerializer,
    transport: Option<T>,
    shared: Option<Arc<T>>,
    state: ServiceState,
    heartbeat_handle: Option<JoinHandle<()>>,
    dispatcher_handle: Option<JoinHandle<()>>,
    in_flight: FetchTasks,
    last_heartbeat: Arc<AtomicI64>,
}

impl<T: Transport + 'static> SuezService<T> {
    pub fn new(config: ServiceConfig, transport: T, api: Arc<dyn WaterUsageApi>) -> Self {
        let topics = TopicSet::new(&config.mqtt.topic_prefix);
        let adapter = FetchAdapter::new(api, config.service.windows);

        Self {
            config,
            topics,
            decoder: Arc::new(CommandDecoder::new()),
            serializer: FetchSerializer::new(adapter),
            transport: Some(transport),
            shared: None,
            state: ServiceState::Starting,
            heartbeat_handle: None,
            dispatcher_handle: None,
            in_flight: Arc::new(Mutex::new(JoinSet::new())),
            last_heartbeat: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn is_fetch_in_progress(&self) -> bool {
        self.serializer.is_busy()
    }

    /// Epoch millis of the last heartbeat published, 0 before the first
    pub fn last_heartbeat_millis(&self) -> i64 {
        self.last_heartbeat.load(Ordering::SeqCst)
    }

    /// The transport, once connected
    pub fn transport(&self) -> Option<&Arc<T>> {
        self.shared.as_ref()
    }

    /// Connect, subscribe to refresh commands and start the background tasks
    ///
    /// A broker that cannot be reached here is fatal: the service ends up
    /// `Stopped` and the error is returned.
    pub async fn start(&mut self) -> ServiceResult<()> {
        if self.state != ServiceState::Starting {
            return Err(ServiceError::lifecycle(format!(
                "cannot start a service that is {}",
                self.state
            )));
        }

        let span = lifecycle_span!(transition = "start");
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&mut self) -> ServiceResult<()> {
        let mut transport = self
            .transport
            .take()
            .ok_or_else(|| ServiceError::internal("transport missing before start"))?;

        info!(
            host = %self.config.mqtt.host,
            port = self.config.mqtt.port,
            prefix = %self.topics.prefix(),
            "Starting service"
        );

        if let Err(e) = transport.connect().await {
            error!(error = %e, "Could not connect to the MQTT broker");
            self.state = ServiceState::Stopped;
            return Err(ServiceError::broker(e));
        }

        let transport = Arc::new(transport);
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        transport.set_message_sender(tx);

        let refresh_topic = self.topics.refresh();
        if let Err(e) = transport.subscribe(&refresh_topic).await {
            error!(topic = %refresh_topic, error = %e, "Could not subscribe to refresh topic");
            if let Err(disconnect_err) = transport.disconnect().await {
                debug!(error = %disconnect_err, "Disconnect after failed subscribe");
            }
            self.state = ServiceState::Stopped;
            return Err(ServiceError::broker(e));
        }
        info!(topic = %refresh_topic, "Listening for refresh commands");

        let publisher = Publisher::new(Arc::clone(&transport), self.topics.clone());

        let interval_secs = self.config.mqtt.heartbeat_interval_secs.max(1);
        self.heartbeat_handle = Some(spawn_heartbeat_task(
            publisher.clone(),
            Duration::from_secs(interval_secs),
            Arc::clone(&self.last_heartbeat),
        ));
        info!(interval_secs, "Heartbeat task started");

        let dispatcher = Dispatcher {
            decoder: Arc::clone(&self.decoder),
            serializer: self.serializer.clone(),
            publisher,
            in_flight: Arc::clone(&self.in_flight),
        };
        self.dispatcher_handle = Some(tokio::spawn(dispatcher.run(rx)));

        self.shared = Some(transport);
        self.state = ServiceState::Running;
        info!("Service running");
        Ok(())
    }

    /// Stop the background tasks, drain the in-flight fetch and disconnect
    ///
    /// The fetch gets `shutdown_grace_secs` to finish before it is aborted.
    /// Calling this more than once is a no-op.
    pub async fn shutdown(&mut self) -> ServiceResult<()> {
        match self.state {
            ServiceState::Stopped | ServiceState::ShuttingDown => return Ok(()),
            ServiceState::Starting => {
                self.state = ServiceState::Stopped;
                return Ok(());
            }
            ServiceState::Running => {}
        }

        let span = lifecycle_span!(transition = "shutdown");
        self.shutdown_inner().instrument(span).await;
        Ok(())
    }

    async fn shutdown_inner(&mut self) {
        info!("Shutting down service");
        self.state = ServiceState::ShuttingDown;

        if let Some(handle) = self.heartbeat_handle.take() {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Heartbeat shutdown error: {}", e);
                }
            }
        }

        // No new fetch can start once the dispatcher is gone
        if let Some(handle) = self.dispatcher_handle.take() {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Dispatcher shutdown error: {}", e);
                }
            }
        }

        let tasks = std::mem::take(
            &mut *self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let grace = Duration::from_secs(self.config.service.shutdown_grace_secs);
        drain_fetches(tasks, grace).await;

        if let Some(transport) = self.shared.take() {
            let publisher = Publisher::new(Arc::clone(&transport), self.topics.clone());
            if let Err(e) = publisher
                .publish(Channel::Status, &StatusMessage::stopped())
                .await
            {
                warn!(error = %e, "Could not publish stopped status");
            }

            if let Err(e) = transport.disconnect().await {
                warn!(error = %e, "Error while disconnecting from broker");
            }
        }

        self.state = ServiceState::Stopped;
        info!("Service stopped");
    }

    /// Start if needed, run until `signal` resolves, then shut down
    pub async fn run_until<F>(&mut self, signal: F) -> ServiceResult<()>
    where
        F: Future<Output = ()>,
    {
        if self.state == ServiceState::Starting {
            self.start().await?;
        }

        signal.await;
        info!("Shutdown requested");
        self.shutdown().await
    }
}

impl<T: Transport + 'static> Drop for SuezService<T> {
    fn drop(&mut self) {
        for handle in [self.heartbeat_handle.take(), self.dispatcher_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Wait up to `grace` for every fetch task, then abort the rest
async fn drain_fetches(mut tasks: JoinSet<()>, grace: Duration) {
    if tasks.is_empty() {
        return;
    }

    info!(
        tasks = tasks.len(),
        grace_secs = grace.as_secs(),
        "Waiting for in-flight fetch"
    );
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    error!("Fetch task failed during shutdown: {}", e);
                }
            }
        }
    })
    .await;

    match drained {
        Ok(()) => debug!("In-flight fetch finished"),
        Err(_) => {
            warn!(
                grace_secs = grace.as_secs(),
                "In-flight fetch did not finish in time, aborting"
            );
            tasks.shutdown().await;
        }
    }
}

/// Publish a heartbeat now and then every `period`
fn spawn_heartbeat_task<T: Transport + 'static>(
    publisher: Publisher<T>,
    period: Duration,
    last_heartbeat: Arc<AtomicI64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let heartbeat = Heartbeat::alive();
            match publisher.publish(Channel::Heartbeat, &heartbeat).await {
                Ok(()) => {
                    last_heartbeat.store(heartbeat.timestamp, Ordering::SeqCst);
                    debug!(timestamp = heartbeat.timestamp, "Heartbeat published");
                }
                Err(e) => {
                    // Keep ticking; the transport reconnects on its own
                    warn!(error = %e, "Heartbeat publish failed");
                }
            }
        }
    })
}

/// Routes refresh messages: decode, gate, fetch, publish
struct Dispatcher<T: Transport + 'static> {
    decoder: Arc<CommandDecoder>,
    serializer: FetchSerializer,
    publisher: Publisher<T>,
    in_flight: FetchTasks,
}

impl<T: Transport + 'static> Dispatcher<T> {
    async fn run(self, mut rx: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = rx.recv().await {
            self.handle(message).await;
        }
        debug!("Inbound channel closed, dispatcher exiting");
    }

    async fn handle(&self, message: InboundMessage) {
        let command = match self.decoder.decode(&message.payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Rejected refresh payload");
                let report = ErrorReport::invalid_command(&e);
                if let Err(e) = self.publisher.publish(Channel::Error, &report).await {
                    error!(error = %e, "Could not report invalid command");
                }
                return;
            }
        };

        let pending = match self.serializer.try_submit(command) {
            Ok(pending) => pending,
            Err(busy) => {
                info!(mode = %busy.rejected, "Fetch in progress, refresh rejected");
                let status = StatusMessage::busy(busy.rejected);
                if let Err(e) = self.publisher.publish(Channel::Status, &status).await {
                    error!(error = %e, "Could not report busy status");
                }
                return;
            }
        };

        info!(mode = %command, "Refresh accepted");
        let publisher = self.publisher.clone();
        let fetch = async move {
            let started = now_millis();
            let result = pending.run().await;
            info!(
                mode = %result.mode(),
                success = result.is_success(),
                elapsed_ms = now_millis() - started,
                "Fetch finished"
            );
            if let Err(e) = publisher.publish_fetch_result(&result).await {
                error!(mode = %result.mode(), error = %e, "Could not publish fetch result");
            }
        };

        // Spawned under the lock so shutdown always sees the task
        let mut tasks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(fetch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockTransport, MockWaterApi};

    fn service(transport: MockTransport) -> SuezService<MockTransport> {
        SuezService::new(
            ServiceConfig::test_config(),
            transport,
            Arc::new(MockWaterApi::new()),
        )
    }

    #[tokio::test]
    async fn test_start_subscribes_and_runs() {
        let mut service = service(MockTransport::new());
        assert_eq!(service.state(), ServiceState::Starting);

        service.start().await.unwrap();
        assert_eq!(service.state(), ServiceState::Running);

        let transport = service.transport().unwrap().clone();
        assert_eq!(
            transport.get_subscriptions().await,
            vec![service.topics().refresh()]
        );

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_broker_failure_is_fatal() {
        let mut service = service(MockTransport::with_connect_failure());

        let err = service.start().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(service.transport().is_none());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut service = service(MockTransport::new());
        service.start().await.unwrap();

        let err = service.start().await.unwrap_err();
        assert!(matches!(err, ServiceError::Lifecycle { .. }));

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_publishes_stopped_and_disconnects() {
        let mut service = service(MockTransport::new());
        service.start().await.unwrap();
        let transport = service.transport().unwrap().clone();

        service.shutdown().await.unwrap();
        service.shutdown().await.unwrap();

        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(transport.disconnect_calls(), 1);

        let statuses = transport.published_on("water/status").await;
        let last = statuses.last().and_then(|m| m.json()).unwrap();
        assert_eq!(last["status"], "stopped");
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let mut service = service(MockTransport::new());
        service.shutdown().await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_fetch_after_grace() {
        let api = Arc::new(MockWaterApi::new().with_delay(Duration::from_secs(3600)));
        let mut config = ServiceConfig::test_config();
        config.service.shutdown_grace_secs = 2;
        let mut service = SuezService::new(config, MockTransport::new(), api.clone());
        service.start().await.unwrap();
        let transport = service.transport().unwrap().clone();

        assert!(transport.inject("water/refresh", b"daily", false).await);
        while api.telemetry_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(service.is_fetch_in_progress());

        service.shutdown().await.unwrap();

        assert!(!service.is_fetch_in_progress());
        assert!(transport.published_on("water/data").await.is_empty());
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_every_fetch_still_publishing() {
        let api = Arc::new(MockWaterApi::new());
        let transport =
            MockTransport::new().with_slow_topic("water/data", Duration::from_secs(5));
        let mut service =
            SuezService::new(ServiceConfig::test_config(), transport, api.clone());
        service.start().await.unwrap();
        let transport = service.transport().unwrap().clone();

        // The first fetch releases the gate, then sits in its slow data publish
        assert!(transport.inject("water/refresh", b"daily", false).await);
        while api.telemetry_calls() < 1 || service.is_fetch_in_progress() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(transport.inject("water/refresh", b"monthly", false).await);
        while api.telemetry_calls() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        service.shutdown().await.unwrap();

        let published = transport.get_published().await;
        let data: Vec<String> = published
            .iter()
            .filter(|m| m.topic == "water/data")
            .filter_map(|m| m.json())
            .map(|v| v["mode"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(data, vec!["daily".to_string(), "monthly".to_string()]);

        let last = published.last().and_then(|m| m.json()).unwrap();
        assert_eq!(last["status"], "stopped");
        assert_eq!(transport.disconnect_calls(), 1);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::ShuttingDown.to_string(), "shutting_down");
        assert_eq!(ServiceState::Running.to_string(), "running");
    }
}
