use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use halo_client::{ApiError, Conditions, RemoteResource};
use halo_core::{
    EntityRow, LookupKey, ReconcileOutcome, RemoteRecord, Scope, SyncCounts, SyncJob, SyncMode,
};
use halo_records::{
    entity_spec, format_filter_time, parse_key, ChildLink, EntitySpec, FetchStrategy,
    InvalidRecord, MapContext, MapError,
};
use halo_store::StoreError;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::SyncServices;

/// Successful runs required before incremental passes send a watermark.
const WATERMARK_MIN_RUNS: usize = 2;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{entity} does not support {operation}")]
    Unsupported {
        entity: &'static str,
        operation: &'static str,
    },
    #[error("invalid record: {0}")]
    Invalid(#[from] InvalidRecord),
    #[error("unknown entity {0}")]
    UnknownEntity(String),
}

impl From<MapError> for SyncError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::Invalid(invalid) => Self::Invalid(invalid),
            MapError::Store(store) => Self::Store(store),
        }
    }
}

/// Running totals of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResults {
    pub counts: SyncCounts,
    /// Lookup keys seen in this pass, including records that failed to save.
    pub synced: BTreeSet<LookupKey>,
}

/// Reconciles one entity type against Halo.
pub struct Synchronizer {
    spec: &'static EntitySpec,
    mode: SyncMode,
    services: SyncServices,
    remote: Arc<dyn RemoteResource>,
    conditions: Conditions,
    scope: Scope,
    parent: Option<LookupKey>,
}

impl Synchronizer {
    pub fn new(spec: &'static EntitySpec, mode: SyncMode, services: SyncServices) -> Self {
        let remote = services.remotes.resource(spec.endpoint);
        Self {
            spec,
            mode,
            services,
            remote,
            conditions: spec.base_conditions(),
            scope: Scope::All,
            parent: None,
        }
    }

    /// Extra conditions for every request; they win over the entity defaults.
    pub fn with_conditions(mut self, conditions: &Conditions) -> Self {
        self.conditions = self.conditions.merged(conditions);
        self
    }

    /// Restrict the pass to the children of one parent row.
    pub fn scoped(mut self, link: &ChildLink, parent: LookupKey) -> Self {
        self.conditions.add(link.remote_param, parent);
        self.scope = link.scope(parent);
        self.parent = Some(parent);
        self
    }

    pub fn spec(&self) -> &'static EntitySpec {
        self.spec
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn conditions(&self) -> &Conditions {
        &self.conditions
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    fn context(&self) -> MapContext {
        MapContext::new(Utc::now(), self.services.settings.keep_closed_days)
    }

    /// Run one logged pass and return its counts.
    ///
    /// The ledger entry is finalized whatever happens, with the counts
    /// reached before any failure.
    #[instrument(skip_all, fields(entity = self.spec.name, mode = self.mode.as_str()))]
    pub async fn sync(&self) -> Result<SyncCounts, SyncError> {
        self.require(self.spec.stored, "sync")?;
        let mut job = SyncJob::start(self.spec.name, self.spec.synchronizer, self.mode, Utc::now());
        self.services.ledger.start(&job).await?;

        let mut results = SyncResults::default();
        let outcome = self.run_pass(&mut results).await;

        job.finish(
            results.counts,
            outcome.as_ref().err().map(ToString::to_string),
            Utc::now(),
        );
        if let Err(err) = self.services.ledger.finish(&job).await {
            error!(job = %job.id, error = %err, "failed to finalize sync job");
            if outcome.is_ok() {
                return Err(err.into());
            }
        }

        match &outcome {
            Ok(()) => info!(counts = %results.counts, "sync finished"),
            Err(err) => error!(counts = %results.counts, error = %err, "sync failed"),
        }
        outcome.map(|()| results.counts)
    }

    /// One pass without a ledger entry, as used for cascades.
    pub async fn sync_unlogged(&self) -> Result<SyncCounts, SyncError> {
        self.require(self.spec.stored, "sync")?;
        let mut results = SyncResults::default();
        self.run_pass(&mut results).await?;
        Ok(results.counts)
    }

    async fn run_pass(&self, results: &mut SyncResults) -> Result<(), SyncError> {
        let ctx = self.context();
        let mut conditions = self.conditions.clone();

        if !self.mode.is_full() {
            if let (Some(param), Some(mark)) = (self.spec.watermark_param, self.watermark().await?)
            {
                debug!(param, %mark, "using watermark");
                conditions.add(param, mark);
            }
        }

        let initial = if self.mode.is_full() {
            self.services.store.keys(self.spec.name, &self.scope).await?
        } else {
            BTreeSet::new()
        };

        self.fetch_records(&conditions, results, &ctx).await?;

        if self.mode.is_full() {
            if let Some(pass) = self.spec.post_fetch {
                let extra = pass(&conditions, &ctx);
                debug!(conditions = ?extra.pairs(), "running extra fetch pass");
                self.fetch_records(&extra, results, &ctx).await?;
            }
            results.counts.deleted = self.prune_stale_records(&initial, &results.synced).await?;
        }
        Ok(())
    }

    /// Start time of the most recent successful run, once there is more than
    /// one to go on.
    pub async fn watermark(&self) -> Result<Option<String>, SyncError> {
        let runs = self
            .services
            .ledger
            .recent_successful(self.spec.name, WATERMARK_MIN_RUNS)
            .await?;
        if runs.len() < WATERMARK_MIN_RUNS {
            return Ok(None);
        }
        Ok(runs.first().map(|run| format_filter_time(run.started_at)))
    }

    pub async fn fetch_records(
        &self,
        conditions: &Conditions,
        results: &mut SyncResults,
        ctx: &MapContext,
    ) -> Result<(), SyncError> {
        match self.spec.fetch {
            FetchStrategy::Paged => self.fetch_pages(conditions, results, ctx).await,
            FetchStrategy::PerParent { parent, param } => {
                self.fetch_per_parent(parent, param, conditions, results, ctx)
                    .await
            }
        }
    }

    async fn fetch_pages(
        &self,
        conditions: &Conditions,
        results: &mut SyncResults,
        ctx: &MapContext,
    ) -> Result<(), SyncError> {
        let batch_size = self.services.settings.batch_size.max(1);
        let mut previous_first = None;
        let mut page = 1;

        loop {
            info!(entity = self.spec.name, page, "fetching records");
            let body = self.remote.fetch_page(page, batch_size, conditions).await?;
            let records = self.spec.page_shape.unpack(body)?;
            let Some(first) = records.first() else {
                break;
            };

            // Halo answers past the last page by repeating a page.
            let first = self.spec.lookup.key_of(first).ok();
            if previous_first.is_some() && previous_first == first {
                debug!(entity = self.spec.name, page, "page repeated, stopping");
                break;
            }

            let full_page = records.len() >= batch_size as usize;
            self.persist_page(records, results, ctx).await?;
            if !full_page {
                break;
            }
            previous_first = first;
            page += 1;
        }
        Ok(())
    }

    async fn fetch_per_parent(
        &self,
        parent_entity: &'static str,
        param: &'static str,
        conditions: &Conditions,
        results: &mut SyncResults,
        ctx: &MapContext,
    ) -> Result<(), SyncError> {
        let parents = match self.parent {
            Some(parent) => BTreeSet::from([parent]),
            None => {
                self.services
                    .store
                    .keys(parent_entity, &Scope::All)
                    .await?
            }
        };

        for parent in parents {
            let conditions = conditions.clone().with(param, parent);
            debug!(entity = self.spec.name, parent, "fetching records for parent");
            let body = self.remote.fetch_all(&conditions).await?;
            let records = self.spec.page_shape.unpack(body)?;
            self.persist_page(records, results, ctx).await?;
        }
        Ok(())
    }

    /// Reconcile one page. Rejected records leave no trace; invalid ones are
    /// logged, and their keys still count as seen.
    pub async fn persist_page(
        &self,
        records: Vec<RemoteRecord>,
        results: &mut SyncResults,
        ctx: &MapContext,
    ) -> Result<(), SyncError> {
        for record in records {
            if !self.spec.accepts(&record, ctx) {
                continue;
            }

            match self.update_or_create_instance(&record).await {
                Ok((_, outcome)) => results.counts.record(outcome),
                Err(SyncError::Invalid(err)) => {
                    warn!(entity = self.spec.name, error = %err, "skipping invalid record");
                }
                Err(err) => return Err(err),
            }

            if let Ok(key) = self.spec.lookup.key_of(&record) {
                results.synced.insert(key);
            }
        }
        Ok(())
    }

    pub async fn update_or_create_instance(
        &self,
        record: &RemoteRecord,
    ) -> Result<(EntityRow, ReconcileOutcome), SyncError> {
        self.require(self.spec.stored, "reconcile")?;
        let store = self.services.store.as_ref();
        let key = self.spec.lookup.key_of(record)?;
        let existing = store.get(self.spec.name, key).await?;

        let mut row = self.spec.apply_record(record, existing.as_ref())?;
        self.spec.resolve_relations(record, &mut row, store).await?;

        let outcome = match &existing {
            None => ReconcileOutcome::Created,
            Some(snapshot) if *snapshot != row => {
                debug!(
                    entity = self.spec.name,
                    key,
                    changed = ?row.changed_fields(snapshot),
                    "record changed"
                );
                ReconcileOutcome::Updated
            }
            Some(_) => ReconcileOutcome::Skipped,
        };

        if outcome != ReconcileOutcome::Skipped {
            store
                .save(self.spec.name, &row)
                .await
                .map_err(|err| SyncError::from(MapError::from(err)))?;
        }
        Ok((row, outcome))
    }

    /// Delete rows seen before the pass but not during it. Returns the
    /// number actually removed.
    pub async fn prune_stale_records(
        &self,
        initial: &BTreeSet<LookupKey>,
        synced: &BTreeSet<LookupKey>,
    ) -> Result<u64, SyncError> {
        let stale: Vec<LookupKey> = initial.difference(synced).copied().collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let store = self.services.store.as_ref();

        let deleted = if self.spec.bulk_prune {
            match store.delete_many(self.spec.name, &stale).await {
                Ok(deleted) => deleted,
                Err(err) if err.is_constraint() => {
                    warn!(
                        entity = self.spec.name,
                        stale = stale.len(),
                        error = %err,
                        "stale records are still referenced, nothing deleted"
                    );
                    0
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            let mut deleted = 0;
            for key in stale {
                match store.delete_many(self.spec.name, &[key]).await {
                    Ok(count) => deleted += count,
                    Err(err) if err.is_constraint() => {
                        warn!(entity = self.spec.name, key, error = %err, "stale record is still referenced");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            deleted
        };

        info!(entity = self.spec.name, deleted, "pruned stale records");
        Ok(deleted)
    }

    fn require(&self, allowed: bool, operation: &'static str) -> Result<(), SyncError> {
        if allowed {
            Ok(())
        } else {
            Err(SyncError::Unsupported {
                entity: self.spec.name,
                operation,
            })
        }
    }

    /// Create the record in Halo, then reconcile what Halo returns.
    ///
    /// Entities without local rows return `None`; when they name a parent,
    /// the parent's children are refreshed instead.
    pub async fn create(&self, payload: JsonValue) -> Result<Option<EntityRow>, SyncError> {
        self.require(self.spec.capabilities.create, "create")?;
        let store = self.services.store.as_ref();
        let payload = self.spec.prepare_payload(payload, store).await?;

        let parent = match self.spec.refresh_after_create {
            Some(refresh) => {
                let key = payload.get(refresh.field).and_then(parse_key);
                let parent = match key {
                    Some(key) => store.get(refresh.entity, key).await?,
                    None => None,
                };
                let parent = parent.ok_or(InvalidRecord::RequiredRelation {
                    relation: refresh.field,
                    remote: key,
                })?;
                Some((refresh, parent))
            }
            None => None,
        };

        let response = self.remote.create(payload).await?;
        if self.spec.stored {
            return self.reconcile_response(response).await.map(Some);
        }
        info!(entity = self.spec.name, "created remote record");
        if let Some((refresh, parent)) = parent {
            let parent_spec = entity_spec(refresh.entity)
                .ok_or_else(|| SyncError::UnknownEntity(refresh.entity.to_string()))?;
            crate::sync_related(&self.services, parent_spec, parent.key).await?;
        }
        Ok(None)
    }

    pub async fn update(&self, id: LookupKey, payload: JsonValue) -> Result<EntityRow, SyncError> {
        self.require(self.spec.capabilities.update, "update")?;
        let response = self.remote.update(id, payload).await?;
        self.reconcile_response(response).await
    }

    pub async fn delete(&self, id: LookupKey) -> Result<(), SyncError> {
        self.require(self.spec.capabilities.delete, "delete")?;
        self.remote.delete(id).await?;
        let deleted = self.services.store.delete_many(self.spec.name, &[id]).await?;
        info!(entity = self.spec.name, id, deleted, "deleted record");
        Ok(())
    }

    async fn reconcile_response(&self, response: JsonValue) -> Result<EntityRow, SyncError> {
        let record = match response {
            JsonValue::Object(record) => record,
            JsonValue::Array(items) => match items.into_iter().next() {
                Some(JsonValue::Object(record)) => record,
                other => {
                    return Err(InvalidRecord::Shape(format!(
                        "write response holds {}",
                        other.unwrap_or(JsonValue::Null)
                    ))
                    .into())
                }
            },
            other => return Err(InvalidRecord::Shape(format!("write response is {other}")).into()),
        };
        let (row, outcome) = self.update_or_create_instance(&record).await?;
        debug!(entity = self.spec.name, key = row.key, outcome = outcome.as_str(), "reconciled write");
        Ok(row)
    }

    /// Refresh every child entity of `parent`; see [`crate::sync_related`].
    pub async fn sync_related(
        &self,
        parent: &EntityRow,
    ) -> Result<Vec<(&'static str, SyncCounts)>, SyncError> {
        crate::sync_related(&self.services, self.spec, parent.key).await
    }
}
