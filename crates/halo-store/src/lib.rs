//! Local relational store, job ledger and coordination backends.
//!
//! Two implementations are provided: [`PgStore`] for production and
//! [`MemoryStore`] for tests. Both honour the same referential
//! rules: saving a row whose relation points at a missing row is a constraint
//! violation, and deleting rows applies each referrer's [`OnDelete`] action
//! atomically.
//!
//! [`OnDelete`]: halo_core::OnDelete

use std::collections::BTreeSet;

use async_trait::async_trait;
use halo_core::{EntityRow, LookupKey, Scope, SyncJob};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "halo-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("sync job {0} is already finalized")]
    LedgerClosed(Uuid),
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        // SQLSTATE class 23 is "integrity constraint violation".
        let is_constraint = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code.starts_with("23"));
        if is_constraint {
            Self::Constraint(err.to_string())
        } else {
            Self::Database(err)
        }
    }
}

/// Persisted rows, grouped by entity type and keyed by lookup key.
///
/// Every mutating call is its own transaction.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, entity: &str, key: LookupKey) -> Result<Option<EntityRow>, StoreError>;

    async fn exists(&self, entity: &str, key: LookupKey) -> Result<bool, StoreError> {
        Ok(self.get(entity, key).await?.is_some())
    }

    async fn keys(&self, entity: &str, scope: &Scope) -> Result<BTreeSet<LookupKey>, StoreError>;

    /// Lowest key of an `entity` row whose `field` equals `value`.
    async fn find_by_field(
        &self,
        entity: &str,
        field: &str,
        value: &JsonValue,
    ) -> Result<Option<LookupKey>, StoreError>;

    /// Insert or replace one row.
    async fn save(&self, entity: &str, row: &EntityRow) -> Result<(), StoreError>;

    /// Delete rows in one all-or-nothing step, returning how many rows of
    /// `entity` were removed. Cascaded rows of other entities are not counted.
    async fn delete_many(&self, entity: &str, keys: &[LookupKey]) -> Result<u64, StoreError>;
}

/// Append-only log of sync runs.
#[async_trait]
pub trait JobLedger: Send + Sync {
    async fn start(&self, job: &SyncJob) -> Result<(), StoreError>;

    /// Persist the final state of a job. Fails with
    /// [`StoreError::LedgerClosed`] if the job was already finalized.
    async fn finish(&self, job: &SyncJob) -> Result<(), StoreError>;

    /// Successful runs for `entity`, most recent start time first.
    async fn recent_successful(&self, entity: &str, limit: usize)
        -> Result<Vec<SyncJob>, StoreError>;

    /// Runs of any outcome, most recent start time first.
    async fn recent(&self, entity: Option<&str>, limit: usize) -> Result<Vec<SyncJob>, StoreError>;
}
