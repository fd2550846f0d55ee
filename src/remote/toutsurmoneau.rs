//! toutsurmoneau.fr client
//!
//! Session-based client for the customer portal of the water utility. Login
//! follows the portal's form flow (fetch the login page for its CSRF token,
//! post the credentials, expect a redirect away from the login page); the
//! session cookie then authorises telemetry requests. Every login starts from
//! an empty cookie store, so a stale session never leaks into the next one.

use super::{Granularity, RemoteError, WaterUsageApi};
use crate::config::AccountSection;
use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{redirect, Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

const LOGIN_PATH: &str = "/mon-compte-en-ligne/je-me-connecte";
const TELEMETRY_PATH: &str = "/public-api/cel-consumption/telemetry";

static CSRF_PATTERNS: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r#"name="_csrf_token"[^>]*value="([^"]*)""#).expect("valid csrf regex"),
        Regex::new(r#"value="([^"]*)"[^>]*name="_csrf_token""#).expect("valid csrf regex"),
    ]
});

/// Client configuration
#[derive(Debug, Clone)]
pub struct ToutSurMonEauConfig {
    pub email: String,
    pub password: String,
    pub meter_id: String,
    pub base_url: String,
    pub verify_ssl: bool,
    pub timeout: Duration,
}

impl ToutSurMonEauConfig {
    pub fn from_account(account: &AccountSection) -> Self {
        Self {
            email: account.email.clone(),
            password: account.password.clone(),
            meter_id: account.meter_id.clone(),
            base_url: account.base_url.clone(),
            verify_ssl: account.verify_ssl,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Cookie-session client for the toutsurmoneau.fr portal
pub struct ToutSurMonEauClient {
    config: ToutSurMonEauConfig,
    /// HTTP client holding the current session's cookies
    session: RwLock<Client>,
}

impl ToutSurMonEauClient {
    pub fn new(config: ToutSurMonEauConfig) -> Result<Self, RemoteError> {
        if config.email.is_empty() || config.password.is_empty() {
            return Err(RemoteError::NotConfigured(
                "account email and password are required".to_string(),
            ));
        }

        if !config.verify_ssl {
            warn!("SSL verification is disabled for the water-usage client");
        }

        let session = RwLock::new(build_http_client(&config)?);
        Ok(Self { config, session })
    }

    async fn current_session(&self) -> Client {
        self.session.read().await.clone()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn telemetry_url(
        &self,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Url, RemoteError> {
        let start = start.format("%Y-%m-%d").to_string();
        let end = end.format("%Y-%m-%d").to_string();
        Url::parse_with_params(
            &self.endpoint(TELEMETRY_PATH),
            &[
                ("id_PDS", self.config.meter_id.as_str()),
                ("mode", granularity.as_str()),
                ("start_date", start.as_str()),
                ("end_date", end.as_str()),
            ],
        )
        .map_err(|e| RemoteError::NotConfigured(format!("invalid base URL: {e}")))
    }
}

/// HTTP client with an empty cookie store
fn build_http_client(config: &ToutSurMonEauConfig) -> Result<Client, RemoteError> {
    let mut builder = Client::builder()
        .cookie_store(true)
        .redirect(redirect::Policy::none())
        .timeout(config.timeout)
        .user_agent(concat!("suez-mqtt/", env!("CARGO_PKG_VERSION")));

    // Only this client skips certificate checks; other HTTP paths stay verified
    if !config.verify_ssl {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| RemoteError::Network(e.to_string()))
}

/// Pull the CSRF token out of the login page
pub fn extract_csrf_token(html: &str) -> Option<String> {
    CSRF_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(html))
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

/// Normalise the telemetry response into a list of measures
///
/// The portal answers either `{"content": {"measures": [...]}}`, a bare array,
/// or a single object; the latter is wrapped into a one-element list.
pub fn extract_measures(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut object) => {
            let nested = object
                .get_mut("content")
                .and_then(|content| content.get_mut("measures"))
                .map(Value::take);
            match nested {
                Some(Value::Array(items)) => items,
                _ => match object.remove("measures") {
                    Some(Value::Array(items)) => items,
                    _ => vec![Value::Object(object)],
                },
            }
        }
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn is_login_redirect(location: &str) -> bool {
    location.contains(LOGIN_PATH)
}

#[async_trait]
impl WaterUsageApi for ToutSurMonEauClient {
    fn name(&self) -> &str {
        "toutsurmoneau"
    }

    fn meter_id(&self) -> &str {
        &self.config.meter_id
    }

    async fn authenticate(&self) -> Result<(), RemoteError> {
        let login_url = self.endpoint(LOGIN_PATH);
        let client = build_http_client(&self.config)?;

        let page = client
            .get(&login_url)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = page.status();
        if !status.is_success() {
            return Err(RemoteError::Api {
                status: status.as_u16(),
                message: "login page unavailable".to_string(),
            });
        }

        let html = page
            .text()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        let token = extract_csrf_token(&html).ok_or_else(|| {
            RemoteError::InvalidResponse("login page has no CSRF token".to_string())
        })?;
        debug!("Obtained login CSRF token");

        let form = [
            ("_csrf_token", token.as_str()),
            ("_username", self.config.email.as_str()),
            ("_password", self.config.password.as_str()),
            ("tsme_user_login[_username]", self.config.email.as_str()),
            ("tsme_user_login[_password]", self.config.password.as_str()),
        ];

        let response = client
            .post(&login_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if is_login_redirect(location) {
                return Err(RemoteError::Authentication {
                    message: "credentials rejected".to_string(),
                    status: Some(status.as_u16()),
                });
            }
            *self.session.write().await = client;
            info!(client = self.name(), "Authenticated with water-usage service");
            return Ok(());
        }

        // The portal re-renders the login form (200) on bad credentials
        Err(RemoteError::Authentication {
            message: "credentials rejected".to_string(),
            status: Some(status.as_u16()),
        })
    }

    async fn telemetry(
        &self,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Value>, RemoteError> {
        let url = self.telemetry_url(granularity, start, end)?;
        debug!(%granularity, %start, %end, "Requesting telemetry");

        let response = self
            .current_session()
            .await
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RemoteError::Authentication {
                message: "session rejected by telemetry endpoint".to_string(),
                status: Some(status.as_u16()),
            });
        }
        if status.is_redirection() {
            return Err(RemoteError::Authentication {
                message: "telemetry request redirected to login".to_string(),
                status: Some(status.as_u16()),
            });
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;

        Ok(extract_measures(body))
    }
}
