//! Reconciliation of Halo records into the local store.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use halo_client::{HaloClient, RemoteFactory, TokenFetcher};
use halo_core::{SyncCounts, SyncMode};
use halo_records::{entity_spec, EntitySpec, ALL_ENTITIES};
use halo_store::{JobLedger, PgStore, RecordStore};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

mod cascade;
mod config;
mod engine;

pub use cascade::sync_related;
pub use config::{
    RequestSettings, SettingsFile, SyncConfig, SyncOverrides, SyncSettings, DEFAULT_BATCH_SIZE,
    DEFAULT_KEEP_CLOSED_DAYS,
};
pub use engine::{SyncError, SyncResults, Synchronizer};

pub const CRATE_NAME: &str = "halo-sync";

/// Shared collaborators, built once and handed to every synchronizer.
#[derive(Clone)]
pub struct SyncServices {
    pub store: Arc<dyn RecordStore>,
    pub ledger: Arc<dyn JobLedger>,
    pub remotes: Arc<dyn RemoteFactory>,
    pub settings: SyncSettings,
}

impl SyncServices {
    pub fn new(
        store: Arc<dyn RecordStore>,
        ledger: Arc<dyn JobLedger>,
        remotes: Arc<dyn RemoteFactory>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            remotes,
            settings,
        }
    }

    pub fn synchronizer(&self, spec: &'static EntitySpec, mode: SyncMode) -> Synchronizer {
        Synchronizer::new(spec, mode, self.clone())
    }

    pub fn synchronizer_for(&self, entity: &str, mode: SyncMode) -> Result<Synchronizer, SyncError> {
        entity_spec(entity)
            .map(|spec| self.synchronizer(spec, mode))
            .ok_or_else(|| SyncError::UnknownEntity(entity.to_string()))
    }
}

/// Postgres store plus a Halo client whose tokens are cached and locked in
/// the same database.
pub async fn connect_services(config: &SyncConfig) -> Result<(SyncServices, Arc<PgStore>, HaloClient)> {
    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?,
    );
    let tokens = TokenFetcher::new(config.credentials(), store.clone())
        .context("building token client")?
        .with_lock(store.clone());
    let client = HaloClient::new(config.resource_server.clone(), tokens, config.client_settings())
        .context("building halo client")?;
    let services = SyncServices::new(
        store.clone(),
        store.clone(),
        Arc::new(client.clone()),
        config.sync,
    );
    Ok((services, store, client))
}

/// Resolve configured entity names, keeping dependency order.
pub fn select_entities(names: &[String]) -> Result<Vec<&'static EntitySpec>> {
    if names.is_empty() {
        return Ok(ALL_ENTITIES.to_vec());
    }
    for name in names {
        if !ALL_ENTITIES.iter().any(|spec| spec.name == name) {
            bail!("unknown entity {name}");
        }
    }
    Ok(ALL_ENTITIES
        .iter()
        .copied()
        .filter(|spec| names.iter().any(|name| name == spec.name))
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityRunResult {
    pub entity: &'static str,
    pub counts: Option<SyncCounts>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: Vec<EntityRunResult>,
}

impl SyncRunSummary {
    pub fn failures(&self) -> usize {
        self.entities.iter().filter(|entity| entity.error.is_some()).count()
    }
}

/// Sync every entity in order. A failing entity is recorded and the run
/// moves on to the next one.
pub async fn run_all(
    services: &SyncServices,
    mode: SyncMode,
    specs: &[&'static EntitySpec],
) -> SyncRunSummary {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, mode = mode.as_str(), entities = specs.len(), "starting sync run");

    let mut entities = Vec::with_capacity(specs.len());
    for &spec in specs {
        let result = services.synchronizer(spec, mode).sync().await;
        entities.push(match result {
            Ok(counts) => EntityRunResult {
                entity: spec.name,
                counts: Some(counts),
                error: None,
            },
            Err(err) => {
                error!(%run_id, entity = spec.name, error = %err, "entity sync failed");
                EntityRunResult {
                    entity: spec.name,
                    counts: None,
                    error: Some(err.to_string()),
                }
            }
        });
    }

    SyncRunSummary {
        run_id,
        mode: mode.as_str(),
        started_at,
        finished_at: Utc::now(),
        entities,
    }
}

/// Cron jobs for full and incremental runs, if the scheduler is enabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    services: SyncServices,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let specs = select_entities(&config.entities)?;

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (cron, mode) in [
        (&config.full_sync_cron, SyncMode::Full),
        (&config.incremental_sync_cron, SyncMode::Incremental),
    ] {
        let services = services.clone();
        let specs = specs.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let services = services.clone();
            let specs = specs.clone();
            Box::pin(async move {
                let summary = run_all(&services, mode, &specs).await;
                info!(
                    run_id = %summary.run_id,
                    mode = summary.mode,
                    failures = summary.failures(),
                    "scheduled sync finished"
                );
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}
