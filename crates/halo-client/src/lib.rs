//! Halo REST client: paged resource access, bounded retry and bearer auth.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use halo_core::LookupKey;
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, warn};

mod auth;
#[cfg(any(test, feature = "testing"))]
pub mod scripted;

pub use auth::{HaloCredentials, TokenFetcher, TOKEN_CACHE_TTL, TOKEN_LOCK_NAME};
#[cfg(any(test, feature = "testing"))]
pub use scripted::{RecordedRequest, ScriptedRemotes, ScriptedResource};

pub const CRATE_NAME: &str = "halo-client";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("unexpected response status {0}")]
    Unexpected(u16),
    #[error("could not acquire token lock: {0}")]
    LockNotAcquired(String),
    #[error("token cache or lock backend failed: {0}")]
    Backend(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Server { .. } => true,
            Self::Transport(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff between GET attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32
            .checked_shl(u32::try_from(attempt_index).unwrap_or(u32::MAX))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Ordered query conditions. Adding a key that is already present replaces
/// its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    entries: Vec<(String, String)>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.add(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(existing, _)| existing != key);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    /// Apply `other` on top of `self`.
    pub fn merged(&self, other: &Conditions) -> Conditions {
        let mut merged = self.clone();
        for (key, value) in &other.entries {
            merged.add(key.clone(), value);
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.entries
    }
}

/// One remote endpoint.
#[async_trait]
pub trait RemoteResource: Send + Sync {
    /// One page of records. Paging parameters override conditions.
    async fn fetch_page(
        &self,
        page: u32,
        batch_size: u32,
        conditions: &Conditions,
    ) -> Result<JsonValue, ApiError>;

    /// Unpaged fetch of everything matching `conditions`.
    async fn fetch_all(&self, conditions: &Conditions) -> Result<JsonValue, ApiError>;

    async fn get(&self, id: LookupKey) -> Result<JsonValue, ApiError>;

    async fn create(&self, payload: JsonValue) -> Result<JsonValue, ApiError>;

    async fn update(&self, id: LookupKey, payload: JsonValue) -> Result<JsonValue, ApiError>;

    async fn delete(&self, id: LookupKey) -> Result<(), ApiError>;
}

/// Hands out resources by endpoint name.
pub trait RemoteFactory: Send + Sync {
    fn resource(&self, endpoint: &str) -> Arc<dyn RemoteResource>;
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct HaloClient {
    http: reqwest::Client,
    resource_server: String,
    tokens: Arc<TokenFetcher>,
    backoff: BackoffPolicy,
}

impl HaloClient {
    pub fn new(
        resource_server: impl Into<String>,
        tokens: TokenFetcher,
        settings: ClientSettings,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            http,
            resource_server: with_trailing_slash(resource_server.into()),
            tokens: Arc::new(tokens),
            backoff: settings.backoff,
        })
    }

    pub fn endpoint(&self, endpoint: &str) -> HaloEndpoint {
        HaloEndpoint {
            client: self.clone(),
            endpoint: endpoint.to_string(),
        }
    }

    pub fn tokens(&self) -> &TokenFetcher {
        &self.tokens
    }

    /// Fetch a fresh token, bypassing the cache.
    pub async fn check_auth(&self) -> Result<(), ApiError> {
        self.tokens.refresh().await.map(|_| ())
    }

    fn build(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&JsonValue>,
        token: &str,
    ) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url).bearer_auth(token).query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, ApiError> {
        debug!(%method, url, ?query, "halo request");
        let token = self.tokens.token().await?;
        let mut response = self
            .build(method.clone(), url, query, body, &token)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(url, "token rejected, refreshing and re-sending once");
            let token = self.tokens.refresh().await?;
            response = self.build(method, url, query, body, &token).send().await?;
        }
        interpret(response).await
    }

    /// GET with retry on server and transient transport failures.
    async fn get_with_retry(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<JsonValue, ApiError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.send(Method::GET, url, query, None).await {
                Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(url, attempt = attempt + 1, ?delay, error = %err, "retrying halo request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

async fn interpret(response: reqwest::Response) -> Result<JsonValue, ApiError> {
    let status = response.status();
    let url = response.url().to_string();
    if status == StatusCode::NO_CONTENT {
        return Ok(JsonValue::Null);
    }
    let text = response.text().await?;

    if status.is_success() {
        if text.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        return serde_json::from_str(&text).map_err(|err| ApiError::Decode(err.to_string()));
    }
    if status == StatusCode::NOT_FOUND {
        warn!(url, "resource not found");
        return Err(ApiError::NotFound(url));
    }

    let message = error_message(&text);
    error!(status = status.as_u16(), url, %message, "failed halo request");
    Err(if status == StatusCode::FORBIDDEN {
        ApiError::PermissionDenied(message)
    } else if status.is_client_error() {
        ApiError::Client {
            status: status.as_u16(),
            message,
        }
    } else if classify_status(status) == RetryDisposition::Retryable {
        ApiError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        ApiError::Unexpected(status.as_u16())
    })
}

/// Best-effort message from one of the several error body shapes Halo uses.
pub fn error_message(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<JsonValue>(body) else {
        return body.trim().to_string();
    };
    match parsed {
        JsonValue::String(message) => message,
        JsonValue::Object(map) => {
            if let Some(description) = map.get("error_description").and_then(JsonValue::as_str) {
                return match map.get("error").and_then(JsonValue::as_str) {
                    Some(error) => format!("{error}: {description}"),
                    None => description.to_string(),
                };
            }
            if map.len() == 1 {
                let only = map.values().next().map(|value| match value {
                    JsonValue::String(text) => text.clone(),
                    other => other.to_string(),
                });
                if let Some(only) = only {
                    return only.replace(['\r', '\n', '\''], "");
                }
            }
            "An unknown error has occurred.".to_string()
        }
        other => other.to_string(),
    }
}

/// A [`HaloClient`] bound to one endpoint path, e.g. `Tickets`.
#[derive(Clone)]
pub struct HaloEndpoint {
    client: HaloClient,
    endpoint: String,
}

impl HaloEndpoint {
    fn url(&self) -> String {
        format!("{}{}", self.client.resource_server, self.endpoint)
    }

    fn record_url(&self, id: LookupKey) -> String {
        format!("{}{}/{id}", self.client.resource_server, self.endpoint)
    }
}

#[async_trait]
impl RemoteResource for HaloEndpoint {
    async fn fetch_page(
        &self,
        page: u32,
        batch_size: u32,
        conditions: &Conditions,
    ) -> Result<JsonValue, ApiError> {
        let paging = Conditions::new()
            .with("page_no", page)
            .with("page_size", batch_size)
            .with("pageinate", true);
        let query = conditions.merged(&paging);
        self.client.get_with_retry(&self.url(), query.pairs()).await
    }

    async fn fetch_all(&self, conditions: &Conditions) -> Result<JsonValue, ApiError> {
        self.client.get_with_retry(&self.url(), conditions.pairs()).await
    }

    async fn get(&self, id: LookupKey) -> Result<JsonValue, ApiError> {
        let query = Conditions::new().with("search_id", id);
        self.client.get_with_retry(&self.url(), query.pairs()).await
    }

    async fn create(&self, payload: JsonValue) -> Result<JsonValue, ApiError> {
        let body = JsonValue::Array(vec![payload]);
        self.client
            .send(Method::POST, &self.url(), &[], Some(&body))
            .await
    }

    async fn update(&self, id: LookupKey, mut payload: JsonValue) -> Result<JsonValue, ApiError> {
        if let JsonValue::Object(map) = &mut payload {
            map.insert("id".to_string(), JsonValue::from(id));
        }
        let body = JsonValue::Array(vec![payload]);
        self.client
            .send(Method::POST, &self.url(), &[], Some(&body))
            .await
    }

    async fn delete(&self, id: LookupKey) -> Result<(), ApiError> {
        self.client
            .send(Method::DELETE, &self.record_url(id), &[], None)
            .await
            .map(|_| ())
    }
}

impl RemoteFactory for HaloClient {
    fn resource(&self, endpoint: &str) -> Arc<dyn RemoteResource> {
        Arc::new(self.endpoint(endpoint))
    }
}
