//! Signed Halo webhook endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use halo_core::SyncMode;
use halo_records::{entity_spec, EntitySpec, InvalidRecord};
use halo_sync::{SyncError, SyncServices};
use hmac::{Hmac, Mac};
use serde_json::Value as JsonValue;
use sha2::Sha256;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub const CRATE_NAME: &str = "halo-web";

/// Header carrying `base64(hmac_sha256(secret, body))`.
pub const TOKEN_HEADER: &str = "Token";

type HmacSha256 = Hmac<Sha256>;

fn body_mac(secret: &str, body: &[u8]) -> Option<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(mac)
}

pub fn sign_body(secret: &str, body: &[u8]) -> String {
    body_mac(secret, body)
        .map(|mac| BASE64.encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Constant-time check of a received token against the body.
pub fn verify_token(secret: &str, body: &[u8], token: &str) -> bool {
    let Ok(received) = BASE64.decode(token.trim()) else {
        return false;
    };
    body_mac(secret, body).is_some_and(|mac| mac.verify_slice(&received).is_ok())
}

/// What to do with a verified callback payload.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn handle(&self, entity: &'static EntitySpec, payload: JsonValue) -> Result<(), SyncError>;
}

/// Reconcile the record under `payload[entity]`, then refresh its children.
pub struct SyncCallbackHandler {
    services: SyncServices,
}

impl SyncCallbackHandler {
    pub fn new(services: SyncServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CallbackHandler for SyncCallbackHandler {
    async fn handle(&self, entity: &'static EntitySpec, payload: JsonValue) -> Result<(), SyncError> {
        let record = match payload.get(entity.name) {
            Some(JsonValue::Object(record)) => record.clone(),
            _ => {
                return Err(InvalidRecord::Shape(format!("callback has no {} object", entity.name)).into())
            }
        };
        let sync = self.services.synchronizer(entity, SyncMode::Full);
        let (row, outcome) = sync.update_or_create_instance(&record).await?;
        info!(entity = entity.name, key = row.key, outcome = outcome.as_str(), "callback reconciled");
        sync.sync_related(&row).await?;
        Ok(())
    }
}

pub struct AppState {
    secret: String,
    handler: Arc<dyn CallbackHandler>,
}

impl AppState {
    pub fn new(secret: impl Into<String>, handler: Arc<dyn CallbackHandler>) -> Self {
        Self {
            secret: secret.into(),
            handler,
        }
    }

    pub fn with_services(secret: impl Into<String>, services: SyncServices) -> Self {
        Self::new(secret, Arc::new(SyncCallbackHandler::new(services)))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/callbacks/{entity}", post(callback_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(bind_addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(bind_addr, "listening for callbacks");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn callback_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(entity): AxumPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    debug!(%entity, bytes = body.len(), "received callback");

    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !verify_token(&state.secret, &body, token) {
        error!(%entity, "invalid callback token");
        return StatusCode::UNAUTHORIZED;
    }

    let payload: JsonValue = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            error!(%entity, error = %err, "callback body is not JSON");
            return StatusCode::BAD_REQUEST;
        }
    };

    // Write-only endpoints have no rows to reconcile.
    let Some(spec) = entity_spec(&entity).filter(|spec| spec.stored) else {
        return StatusCode::NOT_FOUND;
    };

    match state.handler.handle(spec, payload).await {
        Ok(()) => StatusCode::OK,
        Err(SyncError::Invalid(err)) => {
            error!(%entity, error = %err, "callback record rejected");
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Err(err) => {
            error!(%entity, error = %err, "callback handling failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
