use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use halo_core::{
    CacheError, DistributedLock, EntityRow, LockError, LockLease, LookupKey, OnDelete,
    RelationRef, Scope, SyncCounts, SyncJob, SyncMode, TokenCache,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{JobLedger, RecordStore, StoreError};

const LOCK_POLL: Duration = Duration::from_millis(250);

/// Postgres-backed store. Rows live in `halo_records` as JSONB, with one
/// `halo_record_links` row per non-null relation carrying its delete rule.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("migrations complete");
        Ok(())
    }

    async fn cascade_closure(
        tx: &mut Transaction<'_, Postgres>,
        entity: &str,
        keys: &[LookupKey],
    ) -> Result<BTreeSet<(String, LookupKey)>, StoreError> {
        let existing: Vec<LookupKey> = sqlx::query_scalar(
            "SELECT lookup_key FROM halo_records WHERE entity = $1 AND lookup_key = ANY($2)",
        )
        .bind(entity)
        .bind(keys)
        .fetch_all(&mut **tx)
        .await?;

        let mut doomed = BTreeSet::new();
        let mut frontier: Vec<(String, LookupKey)> = existing
            .into_iter()
            .map(|key| (entity.to_string(), key))
            .collect();
        while let Some(target) = frontier.pop() {
            if !doomed.insert(target.clone()) {
                continue;
            }
            let children = sqlx::query(
                r#"
                SELECT entity, lookup_key
                  FROM halo_record_links
                 WHERE target_entity = $1
                   AND target_key = $2
                   AND on_delete = 'cascade'
                "#,
            )
            .bind(&target.0)
            .bind(target.1)
            .fetch_all(&mut **tx)
            .await?;
            for child in children {
                frontier.push((child.try_get("entity")?, child.try_get("lookup_key")?));
            }
        }
        Ok(doomed)
    }
}

fn group_by_entity(rows: &BTreeSet<(String, LookupKey)>) -> BTreeMap<&str, Vec<LookupKey>> {
    let mut grouped: BTreeMap<&str, Vec<LookupKey>> = BTreeMap::new();
    for (entity, key) in rows {
        grouped.entry(entity.as_str()).or_default().push(*key);
    }
    grouped
}

fn row_to_entity(row: &PgRow) -> Result<EntityRow, StoreError> {
    let Json(fields): Json<BTreeMap<String, JsonValue>> = row.try_get("fields")?;
    let Json(relations): Json<BTreeMap<String, RelationRef>> = row.try_get("relations")?;
    Ok(EntityRow {
        key: row.try_get("lookup_key")?,
        fields,
        relations,
    })
}

fn count_column(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} is negative: {value}")))
}

fn count_param(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn row_to_job(row: &PgRow) -> Result<SyncJob, StoreError> {
    let mode: String = row.try_get("mode")?;
    Ok(SyncJob {
        id: row.try_get("id")?,
        entity_name: row.try_get("entity_name")?,
        synchronizer: row.try_get("synchronizer")?,
        mode: mode.parse::<SyncMode>().map_err(StoreError::Corrupt)?,
        started_at: row.try_get("start_time")?,
        finished_at: row.try_get("end_time")?,
        success: row.try_get("success")?,
        counts: SyncCounts {
            created: count_column(row, "added_count")?,
            updated: count_column(row, "updated_count")?,
            skipped: count_column(row, "skipped_count")?,
            deleted: count_column(row, "deleted_count")?,
        },
        message: row.try_get("message")?,
    })
}

const JOB_COLUMNS: &str = "id, entity_name, synchronizer, mode, start_time, end_time, success, \
     added_count, updated_count, skipped_count, deleted_count, message";

#[async_trait]
impl RecordStore for PgStore {
    async fn get(&self, entity: &str, key: LookupKey) -> Result<Option<EntityRow>, StoreError> {
        let row = sqlx::query(
            "SELECT lookup_key, fields, relations FROM halo_records WHERE entity = $1 AND lookup_key = $2",
        )
        .bind(entity)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_entity).transpose()
    }

    async fn keys(&self, entity: &str, scope: &Scope) -> Result<BTreeSet<LookupKey>, StoreError> {
        let keys: Vec<LookupKey> = match scope {
            Scope::All => {
                sqlx::query_scalar("SELECT lookup_key FROM halo_records WHERE entity = $1")
                    .bind(entity)
                    .fetch_all(&self.pool)
                    .await?
            }
            Scope::Related { relation, key } => {
                sqlx::query_scalar(
                    r#"
                    SELECT lookup_key
                      FROM halo_record_links
                     WHERE entity = $1
                       AND relation = $2
                       AND target_key = $3
                    "#,
                )
                .bind(entity)
                .bind(relation)
                .bind(key)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(keys.into_iter().collect())
    }

    async fn find_by_field(
        &self,
        entity: &str,
        field: &str,
        value: &JsonValue,
    ) -> Result<Option<LookupKey>, StoreError> {
        let key: Option<LookupKey> = sqlx::query_scalar(
            r#"
            SELECT lookup_key
              FROM halo_records
             WHERE entity = $1
               AND fields -> $2 = $3
             ORDER BY lookup_key
             LIMIT 1
            "#,
        )
        .bind(entity)
        .bind(field)
        .bind(Json(value))
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    async fn save(&self, entity: &str, row: &EntityRow) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO halo_records (entity, lookup_key, fields, relations, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (entity, lookup_key) DO UPDATE
               SET fields = EXCLUDED.fields,
                   relations = EXCLUDED.relations,
                   updated_at = NOW()
            "#,
        )
        .bind(entity)
        .bind(row.key)
        .bind(Json(&row.fields))
        .bind(Json(&row.relations))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM halo_record_links WHERE entity = $1 AND lookup_key = $2")
            .bind(entity)
            .bind(row.key)
            .execute(&mut *tx)
            .await?;

        for (name, relation) in &row.relations {
            let Some(target) = relation.key else {
                continue;
            };
            sqlx::query(
                r#"
                INSERT INTO halo_record_links
                    (entity, lookup_key, relation, target_entity, target_key, on_delete)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(entity)
            .bind(row.key)
            .bind(name)
            .bind(&relation.entity)
            .bind(target)
            .bind(relation.on_delete.as_str())
            .execute(&mut *tx)
            .await?;
        }

        // Dangling targets surface here, when the deferred check runs.
        tx.commit().await?;
        Ok(())
    }

    async fn delete_many(&self, entity: &str, keys: &[LookupKey]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let doomed = Self::cascade_closure(&mut tx, entity, keys).await?;
        let grouped = group_by_entity(&doomed);

        for (target_entity, target_keys) in &grouped {
            let referrers = sqlx::query(
                r#"
                SELECT entity, lookup_key, relation, on_delete, target_key
                  FROM halo_record_links
                 WHERE target_entity = $1
                   AND target_key = ANY($2)
                "#,
            )
            .bind(*target_entity)
            .bind(target_keys)
            .fetch_all(&mut *tx)
            .await?;

            for referrer in referrers {
                let ref_entity: String = referrer.try_get("entity")?;
                let ref_key: LookupKey = referrer.try_get("lookup_key")?;
                if doomed.contains(&(ref_entity.clone(), ref_key)) {
                    continue;
                }
                let relation: String = referrer.try_get("relation")?;
                let on_delete: String = referrer.try_get("on_delete")?;
                let target_key: LookupKey = referrer.try_get("target_key")?;
                match on_delete.parse::<OnDelete>().map_err(StoreError::Corrupt)? {
                    OnDelete::Restrict => {
                        return Err(StoreError::Constraint(format!(
                            "{ref_entity} {ref_key} relation {relation} still references {target_entity} {target_key}"
                        )));
                    }
                    OnDelete::SetNull => {
                        sqlx::query(
                            r#"
                            UPDATE halo_records
                               SET relations = jsonb_set(relations, $3::text[], 'null'::jsonb),
                                   updated_at = NOW()
                             WHERE entity = $1
                               AND lookup_key = $2
                            "#,
                        )
                        .bind(&ref_entity)
                        .bind(ref_key)
                        .bind(vec![relation.clone(), "key".to_string()])
                        .execute(&mut *tx)
                        .await?;
                        sqlx::query(
                            "DELETE FROM halo_record_links WHERE entity = $1 AND lookup_key = $2 AND relation = $3",
                        )
                        .bind(&ref_entity)
                        .bind(ref_key)
                        .bind(&relation)
                        .execute(&mut *tx)
                        .await?;
                    }
                    OnDelete::Cascade => {}
                }
            }
        }

        let mut deleted = 0;
        for (doomed_entity, doomed_keys) in &grouped {
            let result =
                sqlx::query("DELETE FROM halo_records WHERE entity = $1 AND lookup_key = ANY($2)")
                    .bind(*doomed_entity)
                    .bind(doomed_keys)
                    .execute(&mut *tx)
                    .await?;
            debug!(entity = %doomed_entity, rows = result.rows_affected(), "deleted rows");
            if *doomed_entity == entity {
                deleted = result.rows_affected();
            }
        }
        tx.commit().await?;
        Ok(deleted)
    }
}

#[async_trait]
impl JobLedger for PgStore {
    async fn start(&self, job: &SyncJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_jobs (id, entity_name, synchronizer, mode, start_time)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(job.id)
        .bind(&job.entity_name)
        .bind(&job.synchronizer)
        .bind(job.mode.as_str())
        .bind(job.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish(&self, job: &SyncJob) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET end_time = $2,
                   success = $3,
                   added_count = $4,
                   updated_count = $5,
                   skipped_count = $6,
                   deleted_count = $7,
                   message = $8
             WHERE id = $1
               AND end_time IS NULL
            "#,
        )
        .bind(job.id)
        .bind(job.finished_at.unwrap_or_else(Utc::now))
        .bind(job.success.unwrap_or(false))
        .bind(count_param(job.counts.created))
        .bind(count_param(job.counts.updated))
        .bind(count_param(job.counts.skipped))
        .bind(count_param(job.counts.deleted))
        .bind(job.message.as_deref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::LedgerClosed(job.id));
        }
        Ok(())
    }

    async fn recent_successful(
        &self,
        entity: &str,
        limit: usize,
    ) -> Result<Vec<SyncJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE entity_name = $1 AND success IS TRUE \
             ORDER BY start_time DESC LIMIT $2"
        ))
        .bind(entity)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn recent(&self, entity: Option<&str>, limit: usize) -> Result<Vec<SyncJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE ($1::text IS NULL OR entity_name = $1) \
             ORDER BY start_time DESC LIMIT $2"
        ))
        .bind(entity)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }
}

fn expiry_after(ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
}

#[async_trait]
impl TokenCache for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        sqlx::query_scalar("SELECT value FROM halo_cache WHERE key = $1 AND expires_at > NOW()")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| CacheError::Backend(err.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = expiry_after(ttl)
            .ok_or_else(|| CacheError::Backend(format!("ttl out of range: {ttl:?}")))?;
        sqlx::query(
            r#"
            INSERT INTO halo_cache (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|err| CacheError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn expire(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM halo_cache WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|err| CacheError::Backend(err.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DistributedLock for PgStore {
    async fn acquire(
        &self,
        name: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<LockLease, LockError> {
        let holder = Uuid::new_v4();
        let started = tokio::time::Instant::now();
        loop {
            let expires_at = expiry_after(lease)
                .ok_or_else(|| LockError::Backend(format!("lease out of range: {lease:?}")))?;
            let acquired: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO halo_locks (name, holder, expires_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (name) DO UPDATE
                   SET holder = EXCLUDED.holder,
                       expires_at = EXCLUDED.expires_at
                 WHERE halo_locks.expires_at <= NOW()
                RETURNING holder
                "#,
            )
            .bind(name)
            .bind(holder)
            .bind(expires_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| LockError::Backend(err.to_string()))?;

            if acquired == Some(holder) {
                debug!(lock = name, %holder, "lock acquired");
                return Ok(LockLease {
                    name: name.to_string(),
                    holder,
                });
            }
            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Err(LockError::NotAcquired {
                    name: name.to_string(),
                    waited: wait,
                });
            }
            tokio::time::sleep(LOCK_POLL.min(wait - elapsed)).await;
        }
    }

    async fn release(&self, lease: LockLease) -> Result<(), LockError> {
        sqlx::query("DELETE FROM halo_locks WHERE name = $1 AND holder = $2")
            .bind(&lease.name)
            .bind(lease.holder)
            .execute(&self.pool)
            .await
            .map_err(|err| LockError::Backend(err.to_string()))?;
        Ok(())
    }
}
