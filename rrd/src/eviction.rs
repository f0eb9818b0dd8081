//! Oldest-first eviction.

use crate::adapter::RecordStore;
use crate::context::Context;
use crate::error::Result;

/// What an eviction pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// The record with this timestamp was deleted.
    Evicted(i64),
    /// The tracker reported full but the store had no records to evict.
    Drift,
}

/// Deletes the single oldest record in `store`.
///
/// The oldest record is found with a global minimum reduction over every
/// record, not a sample. Finding nothing is reported as [`Eviction::Drift`]
/// and logged; it is not an error.
///
/// # Errors
///
/// Fails if the reduction or the delete fails. The caller must not insert
/// after a failed eviction.
pub async fn evict_oldest(store: &RecordStore, ctx: &Context) -> Result<Eviction> {
    let Some(oldest) = store.find_oldest(ctx).await? else {
        tracing::warn!("capacity tracker reports full but no record was found to evict");
        return Ok(Eviction::Drift);
    };

    store.delete_by_key(ctx, oldest).await?;
    tracing::trace!(timestamp = oldest, "evicted oldest record");
    Ok(Eviction::Evicted(oldest))
}
