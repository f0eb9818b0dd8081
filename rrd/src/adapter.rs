//! Record store adapter: domain operations over backend primitives.
//!
//! [`RecordStore`] is the only component that knows how records and the
//! persisted counter are laid out as [`Bins`]. It encodes records on the
//! way in and decodes them on the way out; a stored entry that does not
//! decode is an error for the whole call, never a silently dropped row.

use std::sync::Arc;

use crate::backend::{
    BIN_COUNTER, BIN_METRIC_VALUE, BIN_TIMESTAMP, Backend, Bin, Bins, RangeFilter, Reduction, Set,
    Written,
};
use crate::context::Context;
use crate::error::{BackendError, Result};
use crate::record::{MetricValue, Record};

/// Key of the persisted counter inside [`Set::Counter`].
pub const COUNTER_KEY: i64 = 0;

/// Translates record-level operations onto a [`Backend`].
#[derive(Debug, Clone)]
pub struct RecordStore {
    backend: Arc<dyn Backend>,
}

impl RecordStore {
    /// Wraps a backend.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Returns the wrapped backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Writes `record` under its timestamp, overwriting any record already
    /// stored there.
    ///
    /// # Errors
    ///
    /// Fails with `Cancelled`, `BackendUnavailable`, or `Backend`.
    pub async fn insert(&self, ctx: &Context, record: &Record) -> Result<Written> {
        ctx.check("insert")?;
        self.backend
            .put(ctx, Set::Metrics, record.timestamp, encode_record(record))
            .await
    }

    /// Returns every record with `min <= timestamp <= max`, unordered.
    ///
    /// The caller guarantees `min <= max`.
    ///
    /// # Errors
    ///
    /// Fails if the scan fails or any returned entry cannot be decoded.
    pub async fn range_query(&self, ctx: &Context, min: i64, max: i64) -> Result<Vec<Record>> {
        ctx.check("range query")?;
        let filter = RangeFilter::new(BIN_TIMESTAMP, min, max);
        let entries = self.backend.scan(ctx, Set::Metrics, &filter).await?;
        entries
            .iter()
            .map(|bins| decode_record("range query", bins))
            .collect()
    }

    /// Deletes the record stored under `key`. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails with `Cancelled`, `BackendUnavailable`, or `Backend`.
    pub async fn delete_by_key(&self, ctx: &Context, key: i64) -> Result<bool> {
        ctx.check("delete")?;
        self.backend.delete(ctx, Set::Metrics, key).await
    }

    /// Runs the minimum-timestamp reduction over all records and returns the
    /// oldest key, or `None` if there are no records.
    ///
    /// # Errors
    ///
    /// Fails if the reduction fails or returns an entry without a timestamp.
    pub async fn find_oldest(&self, ctx: &Context) -> Result<Option<i64>> {
        ctx.check("find oldest")?;
        let reduction = Reduction::MinimumOf(BIN_TIMESTAMP.to_string());
        let Some(bins) = self.backend.reduce(ctx, Set::Metrics, &reduction).await? else {
            return Ok(None);
        };
        decode_int("find oldest", BIN_TIMESTAMP, &bins).map(Some)
    }

    /// Reads the persisted capacity counter.
    ///
    /// # Errors
    ///
    /// Fails if the read fails or the stored counter is malformed.
    pub async fn read_counter(&self, ctx: &Context) -> Result<Option<u64>> {
        ctx.check("read counter")?;
        let Some(bins) = self.backend.get(ctx, Set::Counter, COUNTER_KEY).await? else {
            return Ok(None);
        };
        let value = decode_int("read counter", BIN_COUNTER, &bins)?;
        u64::try_from(value).map(Some).map_err(|_| {
            BackendError::Decode {
                operation: "read counter",
                field: BIN_COUNTER,
                reason: format!("negative counter {value}"),
            }
            .into()
        })
    }

    /// Overwrites the persisted capacity counter.
    ///
    /// # Errors
    ///
    /// Fails with `Cancelled`, `BackendUnavailable`, or `Backend`.
    pub async fn write_counter(&self, ctx: &Context, value: u64) -> Result<()> {
        ctx.check("write counter")?;
        let value = i64::try_from(value).unwrap_or(i64::MAX);
        let bins = Bins::from([(BIN_COUNTER.to_string(), Bin::Int(value))]);
        self.backend
            .put(ctx, Set::Counter, COUNTER_KEY, bins)
            .await
            .map(|_| ())
    }

    /// Counts the records in the backend with a full scan.
    ///
    /// # Errors
    ///
    /// Fails if the scan fails.
    pub async fn cardinality(&self, ctx: &Context) -> Result<u64> {
        ctx.check("cardinality")?;
        let entries = self
            .backend
            .scan(ctx, Set::Metrics, &RangeFilter::all(BIN_TIMESTAMP))
            .await?;
        Ok(entries.len() as u64)
    }
}

fn encode_record(record: &Record) -> Bins {
    let value = match record.value {
        MetricValue::Int(v) => Bin::Int(v),
        MetricValue::Float(v) => Bin::Float(v),
    };
    Bins::from([
        (BIN_TIMESTAMP.to_string(), Bin::Int(record.timestamp)),
        (BIN_METRIC_VALUE.to_string(), value),
    ])
}

fn decode_record(operation: &'static str, bins: &Bins) -> Result<Record> {
    let timestamp = decode_int(operation, BIN_TIMESTAMP, bins)?;
    let value = match bins.get(BIN_METRIC_VALUE) {
        Some(Bin::Int(v)) => MetricValue::Int(*v),
        Some(Bin::Float(v)) => MetricValue::Float(*v),
        Some(other) => {
            return Err(BackendError::Decode {
                operation,
                field: BIN_METRIC_VALUE,
                reason: format!("expected a number, found {}", other.type_name()),
            }
            .into());
        }
        None => {
            return Err(BackendError::Decode {
                operation,
                field: BIN_METRIC_VALUE,
                reason: "missing".to_string(),
            }
            .into());
        }
    };
    Ok(Record { timestamp, value })
}

fn decode_int(operation: &'static str, field: &'static str, bins: &Bins) -> Result<i64> {
    match bins.get(field) {
        Some(Bin::Int(v)) => Ok(*v),
        Some(other) => Err(BackendError::Decode {
            operation,
            field,
            reason: format!("expected an integer, found {}", other.type_name()),
        }
        .into()),
        None => Err(BackendError::Decode {
            operation,
            field,
            reason: "missing".to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::RrdError;

    fn store() -> (RecordStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        (RecordStore::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_insert_then_range_query_round_trip() {
        let (store, _) = store();
        let ctx = Context::background();
        let record = Record::new(1_717_745_157_997_559, 3.5);

        store.insert(&ctx, &record).await.unwrap();
        let got = store
            .range_query(&ctx, record.timestamp, record.timestamp)
            .await
            .unwrap();

        assert_eq!(got, vec![record]);
    }

    #[tokio::test]
    async fn test_insert_same_timestamp_overwrites() {
        let (store, backend) = store();
        let ctx = Context::background();

        assert_eq!(store.insert(&ctx, &Record::new(5, 1_i64)).await.unwrap(), Written::Created);
        assert_eq!(store.insert(&ctx, &Record::new(5, 2_i64)).await.unwrap(), Written::Replaced);

        assert_eq!(backend.len(Set::Metrics).unwrap(), 1);
        let got = store.range_query(&ctx, 0, 10).await.unwrap();
        assert_eq!(got, vec![Record::new(5, 2_i64)]);
    }

    #[tokio::test]
    async fn test_range_query_fails_on_undecodable_entry() {
        let (store, backend) = store();
        let ctx = Context::background();
        store.insert(&ctx, &Record::new(1, 1.0)).await.unwrap();

        let bad = Bins::from([
            (BIN_TIMESTAMP.to_string(), Bin::Int(2)),
            (BIN_METRIC_VALUE.to_string(), Bin::Text("n/a".to_string())),
        ]);
        backend.put(&ctx, Set::Metrics, 2, bad).await.unwrap();

        let err = store.range_query(&ctx, 0, 10).await.unwrap_err();
        assert!(matches!(
            err,
            RrdError::Backend(BackendError::Decode { field: BIN_METRIC_VALUE, .. })
        ));
    }

    #[tokio::test]
    async fn test_range_query_fails_on_mistyped_timestamp() {
        let (store, backend) = store();
        let ctx = Context::background();
        store.insert(&ctx, &Record::new(1, 1_i64)).await.unwrap();

        let bad = Bins::from([
            (BIN_TIMESTAMP.to_string(), Bin::Float(2.0)),
            (BIN_METRIC_VALUE.to_string(), Bin::Int(7)),
        ]);
        backend.put(&ctx, Set::Metrics, 2, bad).await.unwrap();

        let err = store.range_query(&ctx, 0, 10).await.unwrap_err();
        assert!(matches!(
            err,
            RrdError::Backend(BackendError::Filter { ref bin, .. }) if bin == BIN_TIMESTAMP
        ));
    }

    #[tokio::test]
    async fn test_range_query_fails_on_missing_value() {
        let (store, backend) = store();
        let ctx = Context::background();
        let bad = Bins::from([(BIN_TIMESTAMP.to_string(), Bin::Int(2))]);
        backend.put(&ctx, Set::Metrics, 2, bad).await.unwrap();

        assert!(store.range_query(&ctx, 0, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_by_key_is_idempotent() {
        let (store, _) = store();
        let ctx = Context::background();
        store.insert(&ctx, &Record::new(9, 9_i64)).await.unwrap();

        assert!(store.delete_by_key(&ctx, 9).await.unwrap());
        assert!(!store.delete_by_key(&ctx, 9).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_oldest() {
        let (store, _) = store();
        let ctx = Context::background();
        assert_eq!(store.find_oldest(&ctx).await.unwrap(), None);

        for ts in [30, 10, 20] {
            store.insert(&ctx, &Record::new(ts, 0_i64)).await.unwrap();
        }
        assert_eq!(store.find_oldest(&ctx).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_counter_round_trip() {
        let (store, _) = store();
        let ctx = Context::background();
        assert_eq!(store.read_counter(&ctx).await.unwrap(), None);

        store.write_counter(&ctx, 10).await.unwrap();
        assert_eq!(store.read_counter(&ctx).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_negative_counter_is_decode_error() {
        let (store, backend) = store();
        let ctx = Context::background();
        let bins = Bins::from([(BIN_COUNTER.to_string(), Bin::Int(-1))]);
        backend.put(&ctx, Set::Counter, COUNTER_KEY, bins).await.unwrap();

        assert!(store.read_counter(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_cardinality_counts_only_records() {
        let (store, _) = store();
        let ctx = Context::background();
        store.write_counter(&ctx, 99).await.unwrap();
        for ts in 1..=3 {
            store.insert(&ctx, &Record::new(ts, 0_i64)).await.unwrap();
        }
        assert_eq!(store.cardinality(&ctx).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_before_io() {
        let (store, backend) = store();
        let ctx = Context::background();
        ctx.cancel();

        let err = store.insert(&ctx, &Record::new(1, 1_i64)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(backend.is_empty(Set::Metrics).unwrap());
    }
}
