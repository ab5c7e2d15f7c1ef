use halo_core::{LookupKey, SyncCounts, SyncMode};
use halo_records::{entity_spec, EntitySpec};
use tracing::{info, info_span, Instrument};

use crate::{SyncError, SyncServices, Synchronizer};

/// Run a full, unlogged pass of every child entity of one parent row.
///
/// Each pass only owns the rows that point at `parent`, so pruning never
/// touches children of other parents.
pub async fn sync_related(
    services: &SyncServices,
    spec: &'static EntitySpec,
    parent: LookupKey,
) -> Result<Vec<(&'static str, SyncCounts)>, SyncError> {
    let mut results = Vec::with_capacity(spec.children.len());
    for link in spec.children {
        let child = entity_spec(link.entity)
            .ok_or_else(|| SyncError::UnknownEntity(link.entity.to_string()))?;
        let counts = Synchronizer::new(child, SyncMode::Full, services.clone())
            .scoped(link, parent)
            .sync_unlogged()
            .instrument(info_span!("sync_related", parent = spec.name, key = parent, child = child.name))
            .await?;
        info!(parent = spec.name, key = parent, child = child.name, %counts, "child sync finished");
        results.push((child.name, counts));
    }
    Ok(results)
}
