//! Core sync model shared by the Halo record synchronizer crates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "halo-core";

/// Key used to match a remote record to a local row within one entity type.
pub type LookupKey = i64;

/// One record as returned by the remote API, consumed once per page.
pub type RemoteRecord = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn from_full_flag(full: bool) -> Self {
        if full {
            Self::Full
        } else {
            Self::Incremental
        }
    }

    pub fn is_full(self) -> bool {
        matches!(self, Self::Full)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" | "partial" => Ok(Self::Incremental),
            other => Err(format!("unknown sync mode {other:?}")),
        }
    }
}

/// What happens to a referencing row when the row it points at is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    Cascade,
    SetNull,
    Restrict,
}

impl OnDelete {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cascade => "cascade",
            Self::SetNull => "set_null",
            Self::Restrict => "restrict",
        }
    }
}

impl FromStr for OnDelete {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cascade" => Ok(Self::Cascade),
            "set_null" => Ok(Self::SetNull),
            "restrict" => Ok(Self::Restrict),
            other => Err(format!("unknown on_delete action {other:?}")),
        }
    }
}

/// Foreign-key style pointer from one row to a row of another entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRef {
    pub entity: String,
    pub key: Option<LookupKey>,
    pub on_delete: OnDelete,
}

/// A persisted local row.
///
/// The value read back from a store doubles as the change-tracking snapshot:
/// reconciliation rebuilds the row from the incoming record and compares the
/// two structs, so no per-field dirty flags are kept anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub key: LookupKey,
    #[serde(default)]
    pub fields: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub relations: BTreeMap<String, RelationRef>,
}

impl EntityRow {
    pub fn new(key: LookupKey) -> Self {
        Self {
            key,
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: JsonValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn with_field(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.set_field(name, value);
        self
    }

    pub fn set_relation(
        &mut self,
        name: impl Into<String>,
        entity: impl Into<String>,
        key: Option<LookupKey>,
        on_delete: OnDelete,
    ) {
        self.relations.insert(
            name.into(),
            RelationRef {
                entity: entity.into(),
                key,
                on_delete,
            },
        );
    }

    pub fn with_relation(
        mut self,
        name: impl Into<String>,
        entity: impl Into<String>,
        key: Option<LookupKey>,
        on_delete: OnDelete,
    ) -> Self {
        self.set_relation(name, entity, key, on_delete);
        self
    }

    pub fn relation_key(&self, name: &str) -> Option<LookupKey> {
        self.relations.get(name).and_then(|r| r.key)
    }

    /// Names of fields and relations whose values differ from `snapshot`.
    pub fn changed_fields(&self, snapshot: &EntityRow) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, value) in &self.fields {
            if snapshot.fields.get(name) != Some(value) {
                changed.push(name.clone());
            }
        }
        for name in snapshot.fields.keys() {
            if !self.fields.contains_key(name) {
                changed.push(name.clone());
            }
        }
        for (name, relation) in &self.relations {
            if snapshot.relations.get(name) != Some(relation) {
                changed.push(name.clone());
            }
        }
        for name in snapshot.relations.keys() {
            if !self.relations.contains_key(name) {
                changed.push(name.clone());
            }
        }
        changed
    }
}

/// The set of rows of one entity type that a pass owns for pruning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    All,
    Related { relation: String, key: LookupKey },
}

impl Scope {
    pub fn related(relation: impl Into<String>, key: LookupKey) -> Self {
        Self::Related {
            relation: relation.into(),
            key,
        }
    }

    pub fn matches(&self, row: &EntityRow) -> bool {
        match self {
            Self::All => true,
            Self::Related { relation, key } => row.relation_key(relation) == Some(*key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    Skipped,
}

impl ReconcileOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Updated => "Updated",
            Self::Skipped => "Skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub deleted: u64,
}

impl SyncCounts {
    pub fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Created => self.created += 1,
            ReconcileOutcome::Updated => self.updated += 1,
            ReconcileOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn as_tuple(&self) -> (u64, u64, u64, u64) {
        (self.created, self.updated, self.skipped, self.deleted)
    }
}

impl fmt::Display for SyncCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} skipped={} deleted={}",
            self.created, self.updated, self.skipped, self.deleted
        )
    }
}

/// Ledger entry for one reconciliation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub entity_name: String,
    pub synchronizer: String,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub counts: SyncCounts,
    pub message: Option<String>,
}

impl SyncJob {
    pub fn start(
        entity_name: impl Into<String>,
        synchronizer: impl Into<String>,
        mode: SyncMode,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_name: entity_name.into(),
            synchronizer: synchronizer.into(),
            mode,
            started_at,
            finished_at: None,
            success: None,
            counts: SyncCounts::default(),
            message: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Close the entry. Calling this on an already finished job is a no-op.
    pub fn finish(
        &mut self,
        counts: SyncCounts,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    ) {
        if self.is_finished() {
            return;
        }
        self.counts = counts;
        self.success = Some(error.is_none());
        self.message = error;
        self.finished_at = Some(finished_at);
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Key/value cache with expiry, used for bearer tokens.
#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn expire(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("could not acquire lock {name} within {waited:?}")]
    NotAcquired { name: String, waited: Duration },
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Proof of a held lease; hand it back to [`DistributedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub holder: Uuid,
}

/// Cross-process mutual exclusion with a bounded wait and a timed lease.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(
        &self,
        name: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<LockLease, LockError>;

    /// Release a lease. Releasing an expired or stolen lease is not an error.
    async fn release(&self, lease: LockLease) -> Result<(), LockError>;
}
