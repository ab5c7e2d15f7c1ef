use std::sync::Arc;
use std::time::Duration;

use halo_core::{DistributedLock, LockError, TokenCache};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info_span, Instrument};

use crate::ApiError;

/// Tokens expire locally a minute before Halo expires them.
pub const TOKEN_CACHE_TTL: Duration = Duration::from_secs(3540);
pub const TOKEN_LOCK_NAME: &str = "halo_token_lock";
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_LOCK_LEASE: Duration = Duration::from_secs(31);
const TOKEN_LOCK_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HaloCredentials {
    pub authorisation_server: String,
    pub client_id: String,
    pub client_secret: String,
}

impl HaloCredentials {
    pub fn new(
        authorisation_server: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        let mut authorisation_server = authorisation_server.into();
        if !authorisation_server.ends_with('/') {
            authorisation_server.push('/');
        }
        Self {
            authorisation_server,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn token_url(&self) -> String {
        format!("{}token", self.authorisation_server)
    }
}

/// Client-credentials token source backed by a shared cache.
///
/// When a lock is configured, fetching a new token happens under it so that
/// concurrent workers do not invalidate each other's tokens.
pub struct TokenFetcher {
    http: reqwest::Client,
    credentials: HaloCredentials,
    cache: Arc<dyn TokenCache>,
    lock: Option<Arc<dyn DistributedLock>>,
}

impl TokenFetcher {
    pub fn new(credentials: HaloCredentials, cache: Arc<dyn TokenCache>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            credentials,
            cache,
            lock: None,
        })
    }

    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// `halo_token:{client_id}:{sha256(secret)}`; the secret never lands in
    /// the cache in plain text.
    pub fn cache_key(&self) -> String {
        let digest = Sha256::digest(self.credentials.client_secret.as_bytes());
        format!(
            "halo_token:{}:{}",
            self.credentials.client_id,
            hex::encode(digest)
        )
    }

    /// Cached token, or a new one.
    pub async fn token(&self) -> Result<String, ApiError> {
        if let Some(token) = self.cached().await? {
            return Ok(token);
        }
        self.fetch_guarded(true).await
    }

    /// Always fetch a new token. It is still cached, since a new token may
    /// invalidate older ones.
    pub async fn refresh(&self) -> Result<String, ApiError> {
        self.fetch_guarded(false).await
    }

    async fn cached(&self) -> Result<Option<String>, ApiError> {
        self.cache
            .get(&self.cache_key())
            .await
            .map_err(|err| ApiError::Backend(err.to_string()))
    }

    async fn fetch_guarded(&self, use_cache: bool) -> Result<String, ApiError> {
        let Some(lock) = &self.lock else {
            return self.fetch_and_save().await;
        };

        let lease = lock
            .acquire(TOKEN_LOCK_NAME, TOKEN_LOCK_LEASE, TOKEN_LOCK_WAIT)
            .await
            .map_err(|err| match err {
                LockError::NotAcquired { .. } => {
                    error!(error = %err, "could not acquire token lock");
                    ApiError::LockNotAcquired(err.to_string())
                }
                LockError::Backend(message) => ApiError::Backend(message),
            })?;

        // Another worker may have fetched a token while we waited.
        let result = match self.cached().await {
            Ok(Some(token)) if use_cache => Ok(token),
            Ok(_) => self.fetch_and_save().await,
            Err(err) => Err(err),
        };

        if let Err(err) = lock.release(lease).await {
            error!(error = %err, "failed to release token lock");
        }
        result
    }

    async fn fetch_and_save(&self) -> Result<String, ApiError> {
        let token = self
            .request_token()
            .instrument(info_span!("halo_token", client_id = %self.credentials.client_id))
            .await?;
        self.cache
            .set(&self.cache_key(), &token, TOKEN_CACHE_TTL)
            .await
            .map_err(|err| ApiError::Backend(err.to_string()))?;
        Ok(token)
    }

    async fn request_token(&self) -> Result<String, ApiError> {
        debug!("requesting new access token");
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", "all"),
        ];
        let response = self
            .http
            .post(self.credentials.token_url())
            .form(&form)
            .send()
            .await
            .map_err(|err| {
                error!(error = %err, "failed to get new token");
                ApiError::Auth(err.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("token endpoint returned {status}: {}", crate::error_message(&body));
            error!(%message, "failed to get new token");
            return Err(ApiError::Auth(message));
        }

        let body: JsonValue = response
            .json()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))?;
        body.get("access_token")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Auth("token response has no access_token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_store::MemoryStore;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn cache_key_hashes_secret() {
        let store = Arc::new(MemoryStore::new());
        let fetcher =
            TokenFetcher::new(HaloCredentials::new("https://auth.example", "abc", "s3cret"), store)
                .unwrap();
        let key = fetcher.cache_key();
        assert!(key.starts_with("halo_token:abc:"));
        assert!(!key.contains("s3cret"));
        assert_eq!(key.len(), "halo_token:abc:".len() + 64);
        assert_eq!(fetcher.credentials.token_url(), "https://auth.example/token");
    }

    #[tokio::test]
    async fn refresh_overwrites_cached_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "fresh"})))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let fetcher = TokenFetcher::new(HaloCredentials::new(server.uri(), "id", "secret"), store.clone())
            .unwrap()
            .with_lock(store.clone());
        store
            .set(&fetcher.cache_key(), "stale", TOKEN_CACHE_TTL)
            .await
            .unwrap();

        assert_eq!(fetcher.token().await.unwrap(), "stale");
        assert_eq!(fetcher.refresh().await.unwrap(), "fresh");
        assert_eq!(fetcher.token().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn rejected_credentials_surface_as_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_client",
                "error_description": "unknown client",
            })))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let fetcher =
            TokenFetcher::new(HaloCredentials::new(server.uri(), "id", "bad"), store).unwrap();
        let err = fetcher.token().await.unwrap_err();
        assert!(matches!(err, ApiError::Auth(message) if message.contains("invalid_client: unknown client")));
    }

    #[tokio::test]
    async fn held_lock_surfaces_as_lock_not_acquired() {
        let store = Arc::new(MemoryStore::new());
        let _held = store
            .acquire(TOKEN_LOCK_NAME, Duration::from_secs(120), Duration::ZERO)
            .await
            .unwrap();

        let fetcher = TokenFetcher::new(
            HaloCredentials::new("http://127.0.0.1:9", "id", "secret"),
            store.clone(),
        )
        .unwrap()
        .with_lock(store);

        tokio::time::pause();
        let err = fetcher.refresh().await.unwrap_err();
        assert!(matches!(err, ApiError::LockNotAcquired(_)));
    }
}
