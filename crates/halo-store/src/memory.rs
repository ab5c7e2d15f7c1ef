use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use halo_core::{
    CacheError, DistributedLock, EntityRow, LockError, LockLease, LookupKey, OnDelete, Scope,
    SyncJob, TokenCache,
};
use serde_json::Value as JsonValue;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{JobLedger, RecordStore, StoreError};

const LOCK_POLL: Duration = Duration::from_millis(25);

type RowId = (String, LookupKey);

/// Process-local store implementing every storage trait in this crate.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<String, BTreeMap<LookupKey, EntityRow>>,
    jobs: Vec<SyncJob>,
    cache: HashMap<String, (String, Instant)>,
    locks: HashMap<String, (Uuid, Instant)>,
}

impl MemoryState {
    fn contains(&self, entity: &str, key: LookupKey) -> bool {
        self.rows
            .get(entity)
            .is_some_and(|rows| rows.contains_key(&key))
    }

    /// Requested rows plus everything that cascades from them.
    fn cascade_closure(&self, entity: &str, keys: &[LookupKey]) -> BTreeSet<RowId> {
        let mut doomed = BTreeSet::new();
        let mut frontier: Vec<RowId> = keys
            .iter()
            .filter(|key| self.contains(entity, **key))
            .map(|key| (entity.to_string(), *key))
            .collect();

        while let Some(target) = frontier.pop() {
            if !doomed.insert(target.clone()) {
                continue;
            }
            for (ref_entity, rows) in &self.rows {
                for (ref_key, row) in rows {
                    let cascades_from_target = row.relations.values().any(|r| {
                        r.on_delete == OnDelete::Cascade
                            && r.entity == target.0
                            && r.key == Some(target.1)
                    });
                    if cascades_from_target {
                        frontier.push((ref_entity.clone(), *ref_key));
                    }
                }
            }
        }
        doomed
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn row_count(&self, entity: &str) -> usize {
        self.state().rows.get(entity).map_or(0, BTreeMap::len)
    }

    /// Every ledger entry in insertion order.
    pub fn jobs(&self) -> Vec<SyncJob> {
        self.state().jobs.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, entity: &str, key: LookupKey) -> Result<Option<EntityRow>, StoreError> {
        Ok(self
            .state()
            .rows
            .get(entity)
            .and_then(|rows| rows.get(&key))
            .cloned())
    }

    async fn keys(&self, entity: &str, scope: &Scope) -> Result<BTreeSet<LookupKey>, StoreError> {
        Ok(self
            .state()
            .rows
            .get(entity)
            .map(|rows| {
                rows.values()
                    .filter(|row| scope.matches(row))
                    .map(|row| row.key)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_by_field(
        &self,
        entity: &str,
        field: &str,
        value: &JsonValue,
    ) -> Result<Option<LookupKey>, StoreError> {
        Ok(self.state().rows.get(entity).and_then(|rows| {
            rows.values()
                .find(|row| row.fields.get(field) == Some(value))
                .map(|row| row.key)
        }))
    }

    async fn save(&self, entity: &str, row: &EntityRow) -> Result<(), StoreError> {
        let mut state = self.state();
        for (name, relation) in &row.relations {
            let Some(target) = relation.key else {
                continue;
            };
            let self_reference = relation.entity == entity && target == row.key;
            if !self_reference && !state.contains(&relation.entity, target) {
                return Err(StoreError::Constraint(format!(
                    "{entity} {} relation {name} references missing {} {target}",
                    row.key, relation.entity
                )));
            }
        }
        state
            .rows
            .entry(entity.to_string())
            .or_default()
            .insert(row.key, row.clone());
        Ok(())
    }

    async fn delete_many(&self, entity: &str, keys: &[LookupKey]) -> Result<u64, StoreError> {
        let mut state = self.state();
        let doomed = state.cascade_closure(entity, keys);

        let mut set_null = Vec::new();
        for (ref_entity, rows) in &state.rows {
            for (ref_key, row) in rows {
                if doomed.contains(&(ref_entity.clone(), *ref_key)) {
                    continue;
                }
                for (name, relation) in &row.relations {
                    let Some(target) = relation.key else {
                        continue;
                    };
                    if !doomed.contains(&(relation.entity.clone(), target)) {
                        continue;
                    }
                    match relation.on_delete {
                        OnDelete::Restrict => {
                            return Err(StoreError::Constraint(format!(
                                "{ref_entity} {ref_key} relation {name} still references {} {target}",
                                relation.entity
                            )));
                        }
                        OnDelete::SetNull => {
                            set_null.push((ref_entity.clone(), *ref_key, name.clone()));
                        }
                        // Cascading referrers are already part of the closure.
                        OnDelete::Cascade => {}
                    }
                }
            }
        }

        for (ref_entity, ref_key, name) in set_null {
            if let Some(relation) = state
                .rows
                .get_mut(&ref_entity)
                .and_then(|rows| rows.get_mut(&ref_key))
                .and_then(|row| row.relations.get_mut(&name))
            {
                relation.key = None;
            }
        }

        let mut deleted = 0;
        for (doomed_entity, doomed_key) in &doomed {
            let removed = state
                .rows
                .get_mut(doomed_entity)
                .and_then(|rows| rows.remove(doomed_key))
                .is_some();
            if removed && doomed_entity == entity {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl JobLedger for MemoryStore {
    async fn start(&self, job: &SyncJob) -> Result<(), StoreError> {
        self.state().jobs.push(job.clone());
        Ok(())
    }

    async fn finish(&self, job: &SyncJob) -> Result<(), StoreError> {
        let mut state = self.state();
        match state.jobs.iter_mut().find(|existing| existing.id == job.id) {
            Some(existing) if existing.is_finished() => Err(StoreError::LedgerClosed(job.id)),
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => {
                state.jobs.push(job.clone());
                Ok(())
            }
        }
    }

    async fn recent_successful(
        &self,
        entity: &str,
        limit: usize,
    ) -> Result<Vec<SyncJob>, StoreError> {
        let mut jobs: Vec<SyncJob> = self
            .state()
            .jobs
            .iter()
            .filter(|job| job.entity_name == entity && job.success == Some(true))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn recent(&self, entity: Option<&str>, limit: usize) -> Result<Vec<SyncJob>, StoreError> {
        let mut jobs: Vec<SyncJob> = self
            .state()
            .jobs
            .iter()
            .filter(|job| entity.is_none_or(|name| job.entity_name == name))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[async_trait]
impl TokenCache for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut state = self.state();
        match state.cache.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                state.cache.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.state()
            .cache
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn expire(&self, key: &str) -> Result<(), CacheError> {
        self.state().cache.remove(key);
        Ok(())
    }
}

#[async_trait]
impl DistributedLock for MemoryStore {
    async fn acquire(
        &self,
        name: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<LockLease, LockError> {
        let holder = Uuid::new_v4();
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut state = self.state();
                let now = Instant::now();
                let free = state
                    .locks
                    .get(name)
                    .is_none_or(|(_, expires_at)| *expires_at <= now);
                if free {
                    state.locks.insert(name.to_string(), (holder, now + lease));
                    return Ok(LockLease {
                        name: name.to_string(),
                        holder,
                    });
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::NotAcquired {
                    name: name.to_string(),
                    waited: wait,
                });
            }
            tokio::time::sleep(LOCK_POLL.min(deadline - now)).await;
        }
    }

    async fn release(&self, lease: LockLease) -> Result<(), LockError> {
        let mut state = self.state();
        if state
            .locks
            .get(&lease.name)
            .is_some_and(|(holder, _)| *holder == lease.holder)
        {
            state.locks.remove(&lease.name);
        }
        Ok(())
    }
}
