//! Integration tests for the toutsurmoneau.fr client
//!
//! Tests behavioral contracts against a mock portal:
//! - Login form flow (CSRF token, credential post, redirect detection)
//! - Telemetry request parameters and response shapes
//! - Error mapping (rejected credentials, HTTP errors, malformed bodies)

use chrono::NaiveDate;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use suez_mqtt::config::FetchWindows;
use suez_mqtt::protocol::{ErrorCode, RefreshCommand};
use suez_mqtt::remote::{
    FetchAdapter, FetchResult, Granularity, RemoteError, ToutSurMonEauClient, ToutSurMonEauConfig,
    WaterUsageApi,
};
use wiremock::matchers::{body_string_contains, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LOGIN: &str = "/mon-compte-en-ligne/je-me-connecte";
const TELEMETRY: &str = "/public-api/cel-consumption/telemetry";

const LOGIN_PAGE: &str = r#"<html><form method="post">
<input type="hidden" name="_csrf_token" value="csrf-42">
<input name="tsme_user_login[_username]">
</form></html>"#;

fn test_config(base_url: &str) -> ToutSurMonEauConfig {
    ToutSurMonEauConfig {
        email: "user@example.com".to_string(),
        password: "hunter2".to_string(),
        meter_id: "123456789".to_string(),
        base_url: base_url.to_string(),
        verify_ssl: true,
        timeout: Duration::from_secs(5),
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn mount_login_page(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
        .mount(server)
        .await;
}

async fn mount_successful_login(server: &MockServer) {
    mount_login_page(server).await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .and(body_string_contains("_csrf_token=csrf-42"))
        .and(body_string_contains("_username=user%40example.com"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "/mon-compte-en-ligne/tableau-de-bord")
                .insert_header("Set-Cookie", "eZSESSID=session-1; Path=/"),
        )
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_authenticate_follows_login_form() {
    let mock_server = MockServer::start().await;
    mount_successful_login(&mock_server).await;

    let client = ToutSurMonEauClient::new(test_config(&mock_server.uri())).unwrap();

    client.authenticate().await.unwrap();
}

#[tokio::test]
async fn test_each_login_starts_a_new_session() {
    let mock_server = MockServer::start().await;

    // A logged-in browser is bounced off the login page; we must never be
    Mock::given(method("GET"))
        .and(path(LOGIN))
        .and(header_exists("cookie"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "/mon-compte-en-ligne/tableau-de-bord"),
        )
        .with_priority(1)
        .expect(0)
        .mount(&mock_server)
        .await;
    mount_login_page(&mock_server).await;

    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "/mon-compte-en-ligne/tableau-de-bord")
                .insert_header("Set-Cookie", "eZSESSID=session-1; Path=/"),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "/mon-compte-en-ligne/tableau-de-bord")
                .insert_header("Set-Cookie", "eZSESSID=session-2; Path=/"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(TELEMETRY))
        .and(header("cookie", "eZSESSID=session-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"volume": 0.2}])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = ToutSurMonEauClient::new(test_config(&mock_server.uri())).unwrap();

    client.authenticate().await.unwrap();
    client.authenticate().await.unwrap();

    let measures = client
        .telemetry(Granularity::Daily, date(2024, 1, 1), date(2024, 1, 2))
        .await
        .unwrap();
    assert_eq!(measures.len(), 1);
}

#[tokio::test]
async fn test_authenticate_rejected_when_redirected_back_to_login() {
    let mock_server = MockServer::start().await;
    mount_login_page(&mock_server).await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", LOGIN))
        .mount(&mock_server)
        .await;

    let client = ToutSurMonEauClient::new(test_config(&mock_server.uri())).unwrap();
    let err = client.authenticate().await.unwrap_err();

    assert!(err.is_authentication());
    assert_eq!(err.status_code(), Some(302));
}

#[tokio::test]
async fn test_authenticate_rejected_when_form_rerendered() {
    let mock_server = MockServer::start().await;
    mount_login_page(&mock_server).await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
        .mount(&mock_server)
        .await;

    let client = ToutSurMonEauClient::new(test_config(&mock_server.uri())).unwrap();
    let err = client.authenticate().await.unwrap_err();

    assert!(matches!(
        err,
        RemoteError::Authentication {
            status: Some(200),
            ..
        }
    ));
}

#[tokio::test]
async fn test_authenticate_without_csrf_token() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&mock_server)
        .await;

    let client = ToutSurMonEauClient::new(test_config(&mock_server.uri())).unwrap();
    let err = client.authenticate().await.unwrap_err();

    assert!(matches!(err, RemoteError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_login_page_unavailable() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let client = ToutSurMonEauClient::new(test_config(&mock_server.uri())).unwrap();
    let err = client.authenticate().await.unwrap_err();

    assert_eq!(err.status_code(), Some(503));
    assert!(!err.is_authentication());
}

#[tokio::test]
async fn test_telemetry_sends_window_and_meter() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TELEMETRY))
        .and(query_param("id_PDS", "123456789"))
        .and(query_param("mode", "monthly"))
        .and(query_param("start_date", "2024-01-01"))
        .and(query_param("end_date", "2024-03-31"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": {"measures": [
                {"date": "2024-01", "volume": 4.2},
                {"date": "2024-02", "volume": 3.9},
                {"date": "2024-03", "volume": 4.0}
            ]}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = ToutSurMonEauClient::new(test_config(&mock_server.uri())).unwrap();
    let measures = client
        .telemetry(Granularity::Monthly, date(2024, 1, 1), date(2024, 3, 31))
        .await
        .unwrap();

    assert_eq!(measures.len(), 3);
    assert_eq!(measures[1]["volume"], 3.9);
}

#[tokio::test]
async fn test_telemetry_single_object_is_wrapped() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TELEMETRY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"volume": 1.5})))
        .mount(&mock_server)
        .await;

    let client = ToutSurMonEauClient::new(test_config(&mock_server.uri())).unwrap();
    let measures = client
        .telemetry(Granularity::Daily, date(2024, 1, 1), date(2024, 1, 1))
        .await
        .unwrap();

    assert_eq!(measures, vec![json!({"volume": 1.5})]);
}

#[tokio::test]
async fn test_telemetry_error_statuses() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TELEMETRY))
        .and(query_param("mode", "daily"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path(TELEMETRY))
        .and(query_param("mode", "monthly"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let client = ToutSurMonEauClient::new(test_config(&mock_server.uri())).unwrap();

    let err = client
        .telemetry(Granularity::Daily, date(2024, 1, 1), date(2024, 1, 2))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RemoteError::Api {
            status: 500,
            message: "internal error".to_string()
        }
    );

    let err = client
        .telemetry(Granularity::Monthly, date(2024, 1, 1), date(2024, 1, 2))
        .await
        .unwrap_err();
    assert!(err.is_authentication());
    assert_eq!(err.status_code(), Some(401));
}

#[tokio::test]
async fn test_telemetry_malformed_body() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TELEMETRY))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&mock_server)
        .await;

    let client = ToutSurMonEauClient::new(test_config(&mock_server.uri())).unwrap();
    let err = client
        .telemetry(Granularity::Daily, date(2024, 1, 1), date(2024, 1, 2))
        .await
        .unwrap_err();

    assert!(matches!(err, RemoteError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_adapter_daily_fetch_end_to_end() {
    let mock_server = MockServer::start().await;
    mount_successful_login(&mock_server).await;
    Mock::given(method("GET"))
        .and(path(TELEMETRY))
        .and(query_param("mode", "daily"))
        .and(query_param("start_date", "2024-05-16"))
        .and(query_param("end_date", "2024-06-15"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"date": "2024-06-14", "volume": 0.21},
            {"date": "2024-06-15", "volume": 0.19}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = ToutSurMonEauClient::new(test_config(&mock_server.uri())).unwrap();
    let adapter = FetchAdapter::new(Arc::new(client), FetchWindows::default());

    let result = adapter
        .fetch_on(RefreshCommand::Daily, date(2024, 6, 15))
        .await;

    match result {
        FetchResult::Success(report) => {
            assert_eq!(report.mode, RefreshCommand::Daily);
            assert_eq!(report.meter_id, "123456789");
            assert_eq!(report.record_count(), 2);
            let json = serde_json::to_value(&report).unwrap();
            assert_eq!(json["source"], "toutsurmoneau.fr");
            assert_eq!(json["period"]["start"], "2024-05-16");
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn test_adapter_maps_rejected_login_to_auth_failed() {
    let mock_server = MockServer::start().await;
    mount_login_page(&mock_server).await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", LOGIN))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path(TELEMETRY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = ToutSurMonEauClient::new(test_config(&mock_server.uri())).unwrap();
    let adapter = FetchAdapter::new(Arc::new(client), FetchWindows::default());

    match adapter.fetch(RefreshCommand::Monthly).await {
        FetchResult::Failure(failure) => {
            assert_eq!(failure.code, ErrorCode::AuthFailed);
            assert_eq!(failure.mode, RefreshCommand::Monthly);
            let report = serde_json::to_value(failure.to_error_report()).unwrap();
            assert_eq!(report["code"], "auth_failed");
            assert_eq!(report["status_code"], 302);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}
