//! The storage engine.
//!
//! [`Storage`] ties the components together:
//!
//! - [`RecordStore`] — record encoding over the backend primitives
//! - [`CapacityTracker`] — the advisory record count
//! - [`evict_oldest`] — oldest-first eviction when the tracker reports full
//! - [`TimeRange`] — the `(0, 0)` convention for range reads
//!
//! # Write path
//!
//! ```text
//! set(record)
//!   ├── tracker full?  ── yes ──> evict_oldest  (failure aborts the write)
//!   ├── insert(record)                          (engine lifetime context)
//!   └── new key?       ── yes ──> try_admit ──> persist counter (detached)
//! ```
//!
//! The steps run on a spawned task. Once the eviction has deleted a record,
//! the insert runs under the engine's own context, so neither the caller's
//! deadline nor dropping the `set` future can leave the store one record
//! short.
//!
//! The fullness check, the eviction and the insert are separate steps with
//! no lock around them. Writers racing at the cap can each see "not full"
//! and insert, or pick the same oldest record to evict, so the backend may
//! hold more than `max_records` records. The tracker itself never passes
//! the cap.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rrd::{Context, MemoryBackend, Record, Storage, StorageConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = Context::background();
//! let storage = Storage::open(Arc::new(MemoryBackend::new()), StorageConfig::new(2), &ctx).await?;
//!
//! storage.set(&ctx, Record::new(1, 0.5)).await?;
//! storage.set(&ctx, Record::new(2, 0.7)).await?;
//! storage.set(&ctx, Record::new(3, 0.9)).await?; // evicts timestamp 1
//!
//! let mut records = storage.get_by_range(&ctx, 0, 10).await?;
//! records.sort_by_key(|r| r.timestamp);
//! assert_eq!(records, vec![Record::new(2, 0.7), Record::new(3, 0.9)]);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::adapter::RecordStore;
use crate::backend::{Backend, Written};
use crate::capacity::CapacityTracker;
use crate::config::StorageConfig;
use crate::context::Context;
use crate::error::{BackendError, Result, RrdError};
use crate::eviction::evict_oldest;
use crate::query::TimeRange;
use crate::record::Record;

/// Fixed-capacity, oldest-first-evicting record store.
///
/// `Storage` is `Send + Sync`; share it behind an `Arc` between request
/// handlers.
#[derive(Debug)]
pub struct Storage {
    path: WritePath,
    config: StorageConfig,
}

/// The state a write needs, cloneable into a spawned task.
#[derive(Debug, Clone)]
struct WritePath {
    store: RecordStore,
    tracker: Arc<CapacityTracker>,
    /// Serializes counter writes so the persisted value never moves backwards.
    persist_lock: Arc<Mutex<()>>,
    /// Parent of the contexts used for post-eviction inserts and detached
    /// counter writes. Cancelled on close.
    lifetime: Context,
}

impl Storage {
    /// Opens the engine over `backend` and initializes the record count.
    ///
    /// With `reconcile_on_open` the count is taken from a full scan of the
    /// backend; otherwise from the persisted counter, or 0 if none was
    /// persisted. Either way it is clamped to `max_records`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the backend cannot be read.
    pub async fn open(
        backend: Arc<dyn Backend>,
        config: StorageConfig,
        ctx: &Context,
    ) -> Result<Self> {
        config.validate()?;
        let store = RecordStore::new(backend);

        let persisted = match store.read_counter(ctx).await {
            Ok(value) => value,
            Err(RrdError::Backend(e @ BackendError::Decode { .. })) => {
                tracing::warn!(error = %e, "ignoring malformed persisted counter");
                None
            }
            Err(e) => return Err(e),
        };

        let initial = if config.reconcile_on_open {
            let stored = store.cardinality(ctx).await?;
            if persisted != Some(stored) {
                tracing::info!(
                    persisted = ?persisted,
                    stored,
                    "reconciled record counter with stored records"
                );
            }
            stored
        } else {
            persisted.unwrap_or(0)
        };

        if initial > config.max_records {
            tracing::warn!(
                count = initial,
                max_records = config.max_records,
                "store holds more records than max_records; excess is evicted one per write"
            );
        }

        let storage = Self {
            path: WritePath {
                store,
                tracker: Arc::new(CapacityTracker::new(config.max_records, initial)),
                persist_lock: Arc::new(Mutex::new(())),
                lifetime: Context::background(),
            },
            config,
        };

        tracing::debug!(
            count = storage.count(),
            max_records = storage.max_records(),
            "opened storage"
        );
        Ok(storage)
    }

    /// Stores `record`, evicting the oldest record first when full.
    ///
    /// A record with the timestamp of a stored record replaces it and does
    /// not change the count.
    ///
    /// # Errors
    ///
    /// Fails if the context is done before the write starts, eviction fails
    /// (the record is then not written), or the insert fails. Counter
    /// persistence failures are only logged.
    ///
    /// The caller's context governs the write only up to the eviction. A
    /// write whose eviction has committed runs to completion even if the
    /// context expires or this future is dropped.
    pub async fn set(&self, ctx: &Context, record: Record) -> Result<()> {
        ctx.check("set")?;

        let path = self.path.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { path.write(&ctx, record).await })
            .await
            .map_err(|source| BackendError::Task {
                operation: "set",
                source,
            })?
    }

    /// Returns the records with `min <= timestamp <= max`, in no particular
    /// order. `(0, 0)` reads everything up to now.
    ///
    /// The caller guarantees `0 <= min <= max`; see
    /// [`validate_range`](crate::query::validate_range).
    ///
    /// # Errors
    ///
    /// Fails if the context is done, the scan fails, or a stored record
    /// cannot be decoded.
    pub async fn get_by_range(&self, ctx: &Context, min: i64, max: i64) -> Result<Vec<Record>> {
        let range = TimeRange::new(min, max).resolve();
        self.path.store.range_query(ctx, range.min, range.max).await
    }

    /// Returns the tracked record count.
    pub fn count(&self) -> u64 {
        self.path.tracker.snapshot()
    }

    /// Returns the configured capacity.
    pub fn max_records(&self) -> u64 {
        self.path.tracker.max_records()
    }

    /// Returns true when the tracker reports the store full.
    pub fn is_full(&self) -> bool {
        self.path.tracker.is_full()
    }

    /// Returns the configuration the engine was opened with.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Returns the record store adapter.
    pub fn store(&self) -> &RecordStore {
        &self.path.store
    }

    /// Persists the current count and waits for the write.
    ///
    /// # Errors
    ///
    /// Fails if the counter write fails.
    pub async fn sync_counter(&self, ctx: &Context) -> Result<()> {
        let path = &self.path;
        write_snapshot(&path.store, &path.tracker, &path.persist_lock, ctx).await
    }

    /// Persists the count, stops pending counter writes, and closes the
    /// backend.
    ///
    /// # Errors
    ///
    /// Fails if the backend fails to close. A failed counter write is only
    /// logged.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        if let Err(e) = self.sync_counter(ctx).await {
            tracing::error!(error = %e, "failed to persist record counter on close");
        }
        self.path.lifetime.cancel();
        self.path.store.backend().close().await
    }
}

impl WritePath {
    async fn write(&self, ctx: &Context, record: Record) -> Result<()> {
        let insert_ctx = if self.tracker.is_full() {
            evict_oldest(&self.store, ctx).await?;
            self.lifetime.child()
        } else {
            ctx.clone()
        };

        let written = self.store.insert(&insert_ctx, &record).await?;

        if written == Written::Created && self.tracker.try_admit().is_some() {
            self.persist_counter_detached();
        }
        Ok(())
    }

    fn persist_counter_detached(&self) {
        let store = self.store.clone();
        let tracker = Arc::clone(&self.tracker);
        let lock = Arc::clone(&self.persist_lock);
        let ctx = self.lifetime.child();

        tokio::spawn(async move {
            if let Err(e) = write_snapshot(&store, &tracker, &lock, &ctx).await {
                tracing::error!(error = %e, "failed to persist record counter");
            }
        });
    }
}

/// The snapshot is taken under the lock, so writes land in snapshot order.
async fn write_snapshot(
    store: &RecordStore,
    tracker: &CapacityTracker,
    lock: &Mutex<()>,
    ctx: &Context,
) -> Result<()> {
    let _guard = lock.lock().await;
    let count = tracker.snapshot();
    store.write_counter(ctx, count).await?;
    tracing::trace!(count, "persisted record counter");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Set};
    use std::time::Duration;

    async fn open(backend: Arc<MemoryBackend>, max_records: u64) -> Storage {
        Storage::open(backend, StorageConfig::new(max_records), &Context::background())
            .await
            .unwrap()
    }

    async fn sorted(storage: &Storage, min: i64, max: i64) -> Vec<i64> {
        let mut ts: Vec<i64> = storage
            .get_by_range(&Context::background(), min, max)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.timestamp)
            .collect();
        ts.sort_unstable();
        ts
    }

    #[tokio::test]
    async fn test_round_robin_scenario() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = open(backend.clone(), 5).await;
        let ctx = Context::background();

        for ts in 1..=5 {
            storage.set(&ctx, Record::new(ts, 3.5)).await.unwrap();
        }
        assert_eq!(storage.count(), 5);

        storage.set(&ctx, Record::new(6, 3.5)).await.unwrap();

        assert_eq!(storage.count(), 5);
        assert_eq!(sorted(&storage, 0, 10).await, vec![2, 3, 4, 5, 6]);
        assert_eq!(backend.len(Set::Metrics).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_count_never_exceeds_capacity() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = open(backend.clone(), 3).await;
        let ctx = Context::background();

        for ts in 1..=20 {
            storage.set(&ctx, Record::new(ts, ts)).await.unwrap();
            assert!(storage.count() <= 3);
            assert!(backend.len(Set::Metrics).unwrap() <= 3);
        }
        assert_eq!(sorted(&storage, 0, 100).await, vec![18, 19, 20]);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_count() {
        let storage = open(Arc::new(MemoryBackend::new()), 5).await;
        let ctx = Context::background();

        storage.set(&ctx, Record::new(7, 1_i64)).await.unwrap();
        storage.set(&ctx, Record::new(7, 2_i64)).await.unwrap();

        assert_eq!(storage.count(), 1);
        let got = storage.get_by_range(&ctx, 7, 7).await.unwrap();
        assert_eq!(got, vec![Record::new(7, 2_i64)]);
    }

    #[tokio::test]
    async fn test_empty_range_is_not_an_error() {
        let storage = open(Arc::new(MemoryBackend::new()), 5).await;
        let got = storage.get_by_range(&Context::background(), 0, 100).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_range_reads_up_to_now() {
        let storage = open(Arc::new(MemoryBackend::new()), 10).await;
        let ctx = Context::background();
        let now = crate::record::now_micros();

        storage.set(&ctx, Record::new(1, 1_i64)).await.unwrap();
        storage.set(&ctx, Record::new(now - 1_000, 2_i64)).await.unwrap();
        storage
            .set(&ctx, Record::new(now + 3_600_000_000, 3_i64))
            .await
            .unwrap();

        assert_eq!(sorted(&storage, 0, 0).await, vec![1, now - 1_000]);
    }

    #[tokio::test]
    async fn test_drift_does_not_block_writes() {
        let backend = Arc::new(MemoryBackend::new());
        let ctx = Context::background();
        RecordStore::new(backend.clone()).write_counter(&ctx, 2).await.unwrap();

        let config = StorageConfig {
            max_records: 2,
            reconcile_on_open: false,
        };
        let storage = Storage::open(backend.clone(), config, &ctx).await.unwrap();
        assert!(storage.is_full());

        storage.set(&ctx, Record::new(1, 1_i64)).await.unwrap();
        assert_eq!(backend.len(Set::Metrics).unwrap(), 1);
        assert_eq!(storage.count(), 2);
    }

    #[tokio::test]
    async fn test_reopen_uses_persisted_counter() {
        let backend = Arc::new(MemoryBackend::new());
        let ctx = Context::background();
        {
            let storage = open(backend.clone(), 10).await;
            for ts in 1..=4 {
                storage.set(&ctx, Record::new(ts, 0_i64)).await.unwrap();
            }
            storage.sync_counter(&ctx).await.unwrap();
        }

        let config = StorageConfig {
            max_records: 10,
            reconcile_on_open: false,
        };
        let storage = Storage::open(backend, config, &ctx).await.unwrap();
        assert_eq!(storage.count(), 4);
    }

    #[tokio::test]
    async fn test_reconcile_recounts_stored_records() {
        let backend = Arc::new(MemoryBackend::new());
        let ctx = Context::background();
        let store = RecordStore::new(backend.clone());
        for ts in 1..=3 {
            store.insert(&ctx, &Record::new(ts, 0_i64)).await.unwrap();
        }
        store.write_counter(&ctx, 1).await.unwrap();

        let storage = open(backend, 10).await;
        assert_eq!(storage.count(), 3);
    }

    #[tokio::test]
    async fn test_counter_is_persisted_in_background() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = open(backend.clone(), 10).await;
        let ctx = Context::background();
        for ts in 1..=3 {
            storage.set(&ctx, Record::new(ts, 0_i64)).await.unwrap();
        }

        let store = RecordStore::new(backend);
        let mut persisted = None;
        for _ in 0..100 {
            persisted = store.read_counter(&ctx).await.unwrap();
            if persisted == Some(3) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(persisted, Some(3));
    }

    #[tokio::test]
    async fn test_cancelled_write_has_no_effect() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = open(backend.clone(), 5).await;
        let ctx = Context::background();
        ctx.cancel();

        let err = storage.set(&ctx, Record::new(1, 1_i64)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(storage.count(), 0);
        assert!(backend.is_empty(Set::Metrics).unwrap());
    }

    #[tokio::test]
    async fn test_close_persists_count_and_closes_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = open(backend.clone(), 5).await;
        let ctx = Context::background();
        storage.set(&ctx, Record::new(1, 1_i64)).await.unwrap();

        storage.close(&ctx).await.unwrap();

        let err = storage.set(&ctx, Record::new(2, 1_i64)).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_zero_capacity_is_rejected() {
        let result = Storage::open(
            Arc::new(MemoryBackend::new()),
            StorageConfig::new(0),
            &Context::background(),
        )
        .await;
        assert!(matches!(result, Err(RrdError::Config(_))));
    }
}
