//! In-process remote resources that replay canned responses.
//!
//! Stands in for [`HaloClient`](crate::HaloClient) in tests. Built for this
//! crate's own tests and behind the `testing` feature for downstream crates.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use halo_core::LookupKey;
use serde_json::Value as JsonValue;

use crate::{ApiError, Conditions, RemoteFactory, RemoteResource};

const FIRST_CREATED_ID: LookupKey = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedRequest {
    FetchPage {
        page: u32,
        batch_size: u32,
        conditions: Conditions,
    },
    FetchAll {
        conditions: Conditions,
    },
    Get(LookupKey),
    Create(JsonValue),
    Update(LookupKey, JsonValue),
    Delete(LookupKey),
}

impl RecordedRequest {
    pub fn conditions(&self) -> Option<&Conditions> {
        match self {
            Self::FetchPage { conditions, .. } | Self::FetchAll { conditions } => Some(conditions),
            _ => None,
        }
    }
}

/// Replays queued read responses in order. Once the queue is drained every
/// read returns an empty list.
#[derive(Debug, Default)]
pub struct ScriptedResource {
    state: Mutex<ScriptState>,
}

#[derive(Debug, Default)]
struct ScriptState {
    reads: VecDeque<Result<JsonValue, ApiError>>,
    routes: Vec<(String, String, JsonValue)>,
    records: BTreeMap<LookupKey, JsonValue>,
    writes: VecDeque<Result<JsonValue, ApiError>>,
    requests: Vec<RecordedRequest>,
    created: LookupKey,
}

impl ScriptedResource {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_page(&self, body: JsonValue) -> &Self {
        self.state().reads.push_back(Ok(body));
        self
    }

    pub fn push_error(&self, err: ApiError) -> &Self {
        self.state().reads.push_back(Err(err));
        self
    }

    /// Answer every read whose conditions contain `key=value` with `body`,
    /// ahead of the queue.
    pub fn respond_when(&self, key: &str, value: impl ToString, body: JsonValue) -> &Self {
        self.state()
            .routes
            .push((key.to_string(), value.to_string(), body));
        self
    }

    /// Body returned by `get(id)`.
    pub fn put_record(&self, id: LookupKey, body: JsonValue) -> &Self {
        self.state().records.insert(id, body);
        self
    }

    /// Response for the next write. Without one, writes echo their payload.
    pub fn push_write(&self, result: Result<JsonValue, ApiError>) -> &Self {
        self.state().writes.push_back(result);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    pub fn read_count(&self) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|request| request.conditions().is_some())
            .count()
    }

    fn read(&self, request: RecordedRequest) -> Result<JsonValue, ApiError> {
        let mut state = self.state();
        let routed = request.conditions().and_then(|conditions| {
            state
                .routes
                .iter()
                .find(|(key, value, _)| conditions.get(key) == Some(value.as_str()))
                .map(|(_, _, body)| body.clone())
        });
        state.requests.push(request);
        if let Some(body) = routed {
            return Ok(body);
        }
        state
            .reads
            .pop_front()
            .unwrap_or_else(|| Ok(JsonValue::Array(Vec::new())))
    }

    fn write(&self, request: RecordedRequest, echo: JsonValue) -> Result<JsonValue, ApiError> {
        let mut state = self.state();
        state.requests.push(request);
        state.writes.pop_front().unwrap_or(Ok(echo))
    }
}

#[async_trait]
impl RemoteResource for ScriptedResource {
    async fn fetch_page(
        &self,
        page: u32,
        batch_size: u32,
        conditions: &Conditions,
    ) -> Result<JsonValue, ApiError> {
        self.read(RecordedRequest::FetchPage {
            page,
            batch_size,
            conditions: conditions.clone(),
        })
    }

    async fn fetch_all(&self, conditions: &Conditions) -> Result<JsonValue, ApiError> {
        self.read(RecordedRequest::FetchAll {
            conditions: conditions.clone(),
        })
    }

    async fn get(&self, id: LookupKey) -> Result<JsonValue, ApiError> {
        let mut state = self.state();
        state.requests.push(RecordedRequest::Get(id));
        state
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("scripted record {id}")))
    }

    async fn create(&self, payload: JsonValue) -> Result<JsonValue, ApiError> {
        let mut echo = payload.clone();
        if let JsonValue::Object(map) = &mut echo {
            if !map.contains_key("id") {
                let mut state = self.state();
                state.created += 1;
                map.insert(
                    "id".to_string(),
                    JsonValue::from(FIRST_CREATED_ID + state.created - 1),
                );
            }
        }
        self.write(RecordedRequest::Create(payload), echo)
    }

    async fn update(&self, id: LookupKey, payload: JsonValue) -> Result<JsonValue, ApiError> {
        let mut echo = payload.clone();
        if let JsonValue::Object(map) = &mut echo {
            map.insert("id".to_string(), JsonValue::from(id));
        }
        self.write(RecordedRequest::Update(id, payload), echo)
    }

    async fn delete(&self, id: LookupKey) -> Result<(), ApiError> {
        self.write(RecordedRequest::Delete(id), JsonValue::Null)
            .map(|_| ())
    }
}

/// Scripted resources keyed by endpoint, created on first use.
#[derive(Debug, Default)]
pub struct ScriptedRemotes {
    resources: Mutex<BTreeMap<String, Arc<ScriptedResource>>>,
}

impl ScriptedRemotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, endpoint: &str) -> Arc<ScriptedResource> {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint.to_string())
            .or_default()
            .clone()
    }
}

impl RemoteFactory for ScriptedRemotes {
    fn resource(&self, endpoint: &str) -> Arc<dyn RemoteResource> {
        self.script(endpoint)
    }
}
