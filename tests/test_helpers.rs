//! Test helpers and utilities for integration tests

use std::time::Duration;
use suez_mqtt::config::{AccountSection, MqttSection, ServiceConfig, ServiceSection};
use suez_mqtt::testing::mocks::{MockTransport, PublishedMessage};

/// Create a test configuration for integration tests
#[allow(dead_code)]
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        account: AccountSection {
            email: "user@example.com".to_string(),
            password: "hunter2".to_string(),
            meter_id: "123456789".to_string(),
            verify_ssl: true,
            base_url: "https://www.toutsurmoneau.fr".to_string(),
        },
        mqtt: MqttSection {
            heartbeat_interval_secs: 900,
            ..MqttSection::default()
        },
        service: ServiceSection::default(),
    }
}

/// Poll until `topic` has seen at least `count` publishes, or `timeout` elapses
///
/// Returns whatever was published on `topic` by then.
#[allow(dead_code)]
pub async fn wait_for_publishes(
    transport: &MockTransport,
    topic: &str,
    count: usize,
    timeout: Duration,
) -> Vec<PublishedMessage> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let published = transport.published_on(topic).await;
        if published.len() >= count || tokio::time::Instant::now() >= deadline {
            return published;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
