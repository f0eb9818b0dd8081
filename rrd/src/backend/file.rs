//! Persistent backend over a store directory.
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//! ├── records.slab     <- metrics set, memory-mapped slots (see slab module)
//! └── counter.json     <- counter set, rewritten on every change
//! ```
//!
//! The metrics set is indexed by timestamp in memory: the index is rebuilt
//! from the slab when the directory is opened, so range scans and the
//! minimum reduction never touch unrelated slots. The slab doubles in size
//! whenever a new key arrives and every slot is taken.
//!
//! Writes, deletes and close touch the filesystem (slab growth, the counter
//! file rename, flushes) and run on tokio's blocking pool. Reads are served
//! from the index and the mapped pages on the calling task.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::task;

use super::slab::{RecordSlab, SlotEntry};
use super::{
    BIN_METRIC_VALUE, BIN_TIMESTAMP, Backend, Bin, Bins, RangeFilter, Reduction, Set, Written,
};
use crate::context::Context;
use crate::error::{BackendError, Result, UnavailableError};
use crate::record::MetricValue;

/// Name of the slab file holding the metrics set.
pub const RECORDS_FILE: &str = "records.slab";

/// Name of the JSON file holding the counter set.
pub const COUNTER_FILE: &str = "counter.json";

/// Slots allocated for a freshly created slab.
pub const DEFAULT_INITIAL_SLOTS: u32 = 1024;

/// Backend persisting to a store directory.
#[derive(Debug)]
pub struct FileBackend {
    inner: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    /// Path to the store directory.
    path: PathBuf,
    /// Metrics set: slab plus in-memory timestamp index.
    records: Mutex<IndexedSlab>,
    /// Counter set, mirrored to `counter.json`.
    counter: Mutex<JsonSet>,
    closed: AtomicBool,
}

#[derive(Debug)]
struct IndexedSlab {
    slab: RecordSlab,
    /// Timestamp -> slot.
    index: BTreeMap<i64, u32>,
    /// Empty slots available for new keys.
    free: Vec<u32>,
}

#[derive(Debug)]
struct JsonSet {
    path: PathBuf,
    entries: BTreeMap<i64, Bins>,
}

/// Point-in-time description of a file store, for inspection tools.
#[derive(Debug, Clone, PartialEq)]
pub struct FileStats {
    /// Slots in the slab.
    pub slot_count: u32,
    /// Slots holding a record.
    pub records: usize,
    /// Size of the slab file in bytes.
    pub slab_bytes: u64,
    /// Smallest stored timestamp.
    pub oldest: Option<i64>,
    /// Largest stored timestamp.
    pub newest: Option<i64>,
}

impl FileBackend {
    /// Opens the store directory at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// - [`UnavailableError::Open`] if the directory cannot be created
    /// - [`BackendError::Corrupted`] if an existing slab or counter file is invalid
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_slots(path, DEFAULT_INITIAL_SLOTS)
    }

    /// Like [`FileBackend::open`], sizing a newly created slab to
    /// `initial_slots`. Existing slabs keep their size.
    ///
    /// # Errors
    ///
    /// See [`FileBackend::open`].
    pub fn open_with_slots<P: AsRef<Path>>(path: P, initial_slots: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        fs::create_dir_all(&path).map_err(|e| UnavailableError::Open {
            path: path.clone(),
            source: e,
        })?;

        let slab_path = path.join(RECORDS_FILE);
        let slab = if slab_path.exists() {
            RecordSlab::open(&slab_path)?
        } else {
            RecordSlab::create(&slab_path, initial_slots)?
        };
        let records = IndexedSlab::rebuild(slab)?;
        let counter = JsonSet::load(path.join(COUNTER_FILE))?;

        tracing::debug!(
            path = %path.display(),
            records = records.index.len(),
            slots = records.slab.slot_count(),
            "opened file backend"
        );

        Ok(Self {
            inner: Arc::new(Shared {
                path,
                records: Mutex::new(records),
                counter: Mutex::new(counter),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the path to the store directory.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Describes the slab without going through a context.
    ///
    /// # Errors
    ///
    /// Fails if an internal lock is poisoned.
    pub fn stats(&self) -> Result<FileStats> {
        let records = self.inner.records("stats")?;
        Ok(FileStats {
            slot_count: records.slab.slot_count(),
            records: records.index.len(),
            slab_bytes: records.slab.file_size(),
            oldest: records.index.keys().next().copied(),
            newest: records.index.keys().next_back().copied(),
        })
    }

    /// Runs `f` against the shared state on the blocking pool.
    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Shared) -> Result<T> + Send + 'static,
    {
        let shared = Arc::clone(&self.inner);
        task::spawn_blocking(move || f(&shared))
            .await
            .map_err(|source| BackendError::Task { operation, source })?
    }
}

impl Shared {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UnavailableError::Closed.into());
        }
        Ok(())
    }

    fn records(&self, operation: &'static str) -> Result<MutexGuard<'_, IndexedSlab>> {
        self.records
            .lock()
            .map_err(|_| BackendError::Poisoned { operation }.into())
    }

    fn counter(&self, operation: &'static str) -> Result<MutexGuard<'_, JsonSet>> {
        self.counter
            .lock()
            .map_err(|_| BackendError::Poisoned { operation }.into())
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn put(&self, ctx: &Context, set: Set, key: i64, bins: Bins) -> Result<Written> {
        ctx.check("put")?;
        self.inner.ensure_open()?;
        match set {
            Set::Metrics => {
                let value = metric_value_from_bins(key, &bins)?;
                self.blocking("put", move |shared| shared.records("put")?.put(key, value))
                    .await
            }
            Set::Counter => {
                self.blocking("put", move |shared| shared.counter("put")?.put(key, bins))
                    .await
            }
        }
    }

    async fn get(&self, ctx: &Context, set: Set, key: i64) -> Result<Option<Bins>> {
        ctx.check("get")?;
        let shared = &self.inner;
        shared.ensure_open()?;
        match set {
            Set::Metrics => Ok(shared.records("get")?.get(key)),
            Set::Counter => Ok(shared.counter("get")?.entries.get(&key).cloned()),
        }
    }

    async fn delete(&self, ctx: &Context, set: Set, key: i64) -> Result<bool> {
        ctx.check("delete")?;
        self.inner.ensure_open()?;
        self.blocking("delete", move |shared| match set {
            Set::Metrics => Ok(shared.records("delete")?.delete(key)),
            Set::Counter => shared.counter("delete")?.delete(key),
        })
        .await
    }

    async fn scan(&self, ctx: &Context, set: Set, filter: &RangeFilter) -> Result<Vec<Bins>> {
        ctx.check("scan")?;
        let shared = &self.inner;
        shared.ensure_open()?;
        filter.validate()?;
        match set {
            Set::Metrics => {
                if filter.bin != BIN_TIMESTAMP {
                    return Err(BackendError::Filter {
                        bin: filter.bin.clone(),
                        min: filter.min,
                        max: filter.max,
                        reason: format!("metrics set is only indexed on '{BIN_TIMESTAMP}'"),
                    }
                    .into());
                }
                Ok(shared.records("scan")?.range(filter.min, filter.max))
            }
            Set::Counter => shared
                .counter("scan")?
                .entries
                .values()
                .filter_map(|bins| match filter.select(bins) {
                    Ok(true) => Some(Ok(bins.clone())),
                    Ok(false) => None,
                    Err(e) => Some(Err(e)),
                })
                .collect(),
        }
    }

    async fn reduce(
        &self,
        ctx: &Context,
        set: Set,
        reduction: &Reduction,
    ) -> Result<Option<Bins>> {
        ctx.check("reduce")?;
        let shared = &self.inner;
        shared.ensure_open()?;
        match (set, reduction) {
            (Set::Metrics, Reduction::MinimumOf(bin)) if bin == BIN_TIMESTAMP => {
                let records = shared.records("reduce")?;
                Ok(records.index.keys().next().and_then(|&ts| records.get(ts)))
            }
            (Set::Metrics, _) => Err(BackendError::Reduction {
                name: reduction.name(),
                reason: format!("metrics set only supports reductions over '{BIN_TIMESTAMP}'"),
            }
            .into()),
            (Set::Counter, _) => {
                let counter = shared.counter("reduce")?;
                Ok(reduction.apply(counter.entries.values())?.cloned())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.blocking("close", |shared| shared.records("close")?.slab.flush())
            .await?;
        tracing::debug!(path = %self.inner.path.display(), "closed file backend");
        Ok(())
    }
}

impl IndexedSlab {
    fn rebuild(slab: RecordSlab) -> Result<Self> {
        let mut index = BTreeMap::new();
        let mut free = Vec::new();

        for slot in (0..slab.slot_count()).rev() {
            match slab.read(slot) {
                Some(entry) => {
                    if let Some(previous) = index.insert(entry.timestamp, slot) {
                        return Err(BackendError::Corrupted {
                            path: slab.path().to_path_buf(),
                            reason: format!(
                                "timestamp {} stored in slots {slot} and {previous}",
                                entry.timestamp
                            ),
                        }
                        .into());
                    }
                }
                None => free.push(slot),
            }
        }

        Ok(Self { slab, index, free })
    }

    fn put(&mut self, key: i64, value: MetricValue) -> Result<Written> {
        if let Some(&slot) = self.index.get(&key) {
            self.slab.write(slot, key, value);
            return Ok(Written::Replaced);
        }

        if self.free.is_empty() {
            let old = self.slab.slot_count();
            let new = old.saturating_mul(2).max(old.saturating_add(1));
            self.slab.grow(new)?;
            self.free.extend((old..new).rev());
        }

        let Some(slot) = self.free.pop() else {
            return Err(BackendError::UnsupportedBins {
                set: Set::Metrics.name(),
                key,
                reason: "record slab is at its maximum size".to_string(),
            }
            .into());
        };
        self.slab.write(slot, key, value);
        self.index.insert(key, slot);
        Ok(Written::Created)
    }

    fn get(&self, key: i64) -> Option<Bins> {
        let slot = *self.index.get(&key)?;
        self.slab.read(slot).map(bins_from_entry)
    }

    fn delete(&mut self, key: i64) -> bool {
        match self.index.remove(&key) {
            Some(slot) => {
                self.slab.clear(slot);
                self.free.push(slot);
                true
            }
            None => false,
        }
    }

    fn range(&self, min: i64, max: i64) -> Vec<Bins> {
        self.index
            .range(min..=max)
            .filter_map(|(_, &slot)| self.slab.read(slot))
            .map(bins_from_entry)
            .collect()
    }
}

impl JsonSet {
    fn load(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path,
                entries: BTreeMap::new(),
            });
        }

        let data = fs::read_to_string(&path).map_err(|e| BackendError::Io {
            operation: "load counter set",
            path: path.clone(),
            source: e,
        })?;
        let entries = serde_json::from_str(&data).map_err(|e| BackendError::Json {
            operation: "load",
            path: path.clone(),
            source: e,
        })?;
        Ok(Self { path, entries })
    }

    fn put(&mut self, key: i64, bins: Bins) -> Result<Written> {
        let previous = self.entries.insert(key, bins);
        self.save()?;
        Ok(match previous {
            Some(_) => Written::Replaced,
            None => Written::Created,
        })
    }

    fn delete(&mut self, key: i64) -> Result<bool> {
        if self.entries.remove(&key).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Writes to a sibling temp file and renames it over the target, so a
    /// crash never leaves a half-written file behind.
    fn save(&self) -> Result<()> {
        let data = serde_json::to_string_pretty(&self.entries).map_err(|e| BackendError::Json {
            operation: "save",
            path: self.path.clone(),
            source: e,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data).map_err(|e| BackendError::Io {
            operation: "save counter set",
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| BackendError::Io {
            operation: "save counter set",
            path: self.path.clone(),
            source: e,
        })?;
        Ok(())
    }
}

/// The metrics set stores exactly `{timestamp, metric_value}`, with the
/// timestamp equal to the key.
fn metric_value_from_bins(key: i64, bins: &Bins) -> Result<MetricValue> {
    let reject = |reason: String| BackendError::UnsupportedBins {
        set: Set::Metrics.name(),
        key,
        reason,
    };

    if let Some(extra) = bins
        .keys()
        .find(|name| name.as_str() != BIN_TIMESTAMP && name.as_str() != BIN_METRIC_VALUE)
    {
        return Err(reject(format!("unexpected bin '{extra}'")).into());
    }
    match bins.get(BIN_TIMESTAMP) {
        Some(Bin::Int(ts)) if *ts == key => {}
        Some(other) => {
            return Err(reject(format!("'{BIN_TIMESTAMP}' bin must equal the key, got {other:?}")).into());
        }
        None => return Err(reject(format!("missing '{BIN_TIMESTAMP}' bin")).into()),
    }
    match bins.get(BIN_METRIC_VALUE) {
        Some(Bin::Int(v)) => Ok(MetricValue::Int(*v)),
        Some(Bin::Float(v)) => Ok(MetricValue::Float(*v)),
        Some(other) => Err(reject(format!(
            "'{BIN_METRIC_VALUE}' must be numeric, got {}",
            other.type_name()
        ))
        .into()),
        None => Err(reject(format!("missing '{BIN_METRIC_VALUE}' bin")).into()),
    }
}

fn bins_from_entry(entry: SlotEntry) -> Bins {
    let mut bins = Bins::from([(BIN_TIMESTAMP.to_string(), Bin::Int(entry.timestamp))]);
    match entry.value {
        Some(MetricValue::Int(v)) => {
            bins.insert(BIN_METRIC_VALUE.to_string(), Bin::Int(v));
        }
        Some(MetricValue::Float(v)) => {
            bins.insert(BIN_METRIC_VALUE.to_string(), Bin::Float(v));
        }
        None => {}
    }
    bins
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BIN_COUNTER;
    use tempfile::tempdir;

    fn record_bins(ts: i64, value: Bin) -> Bins {
        Bins::from([
            (BIN_TIMESTAMP.to_string(), Bin::Int(ts)),
            (BIN_METRIC_VALUE.to_string(), value),
        ])
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();

        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend
                .put(&ctx, Set::Metrics, 10, record_bins(10, Bin::Float(1.5)))
                .await
                .unwrap();
            backend
                .put(&ctx, Set::Metrics, 20, record_bins(20, Bin::Int(7)))
                .await
                .unwrap();
            backend.close().await.unwrap();
        }

        let backend = FileBackend::open(dir.path()).unwrap();
        let got = backend.get(&ctx, Set::Metrics, 20).await.unwrap();
        assert_eq!(got, Some(record_bins(20, Bin::Int(7))));

        let stats = backend.stats().unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.oldest, Some(10));
        assert_eq!(stats.newest, Some(20));
    }

    #[tokio::test]
    async fn test_slab_grows_past_initial_slots() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        let backend = FileBackend::open_with_slots(dir.path(), 2).unwrap();

        for ts in 0..5 {
            let written = backend
                .put(&ctx, Set::Metrics, ts, record_bins(ts, Bin::Int(ts)))
                .await
                .unwrap();
            assert_eq!(written, Written::Created);
        }

        let stats = backend.stats().unwrap();
        assert_eq!(stats.records, 5);
        assert!(stats.slot_count >= 5);
    }

    #[tokio::test]
    async fn test_deleted_slot_is_reused() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        let backend = FileBackend::open_with_slots(dir.path(), 1).unwrap();

        backend.put(&ctx, Set::Metrics, 1, record_bins(1, Bin::Int(1))).await.unwrap();
        assert!(backend.delete(&ctx, Set::Metrics, 1).await.unwrap());
        backend.put(&ctx, Set::Metrics, 2, record_bins(2, Bin::Int(2))).await.unwrap();

        assert_eq!(backend.stats().unwrap().slot_count, 1);
    }

    #[tokio::test]
    async fn test_scan_uses_inclusive_bounds() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        let backend = FileBackend::open(dir.path()).unwrap();
        for ts in 1..=6 {
            backend
                .put(&ctx, Set::Metrics, ts, record_bins(ts, Bin::Int(ts)))
                .await
                .unwrap();
        }

        let got = backend
            .scan(&ctx, Set::Metrics, &RangeFilter::new(BIN_TIMESTAMP, 2, 4))
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
    }

    #[tokio::test]
    async fn test_metrics_set_rejects_foreign_bins() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        let backend = FileBackend::open(dir.path()).unwrap();

        let text = record_bins(1, Bin::Text("x".to_string()));
        assert!(backend.put(&ctx, Set::Metrics, 1, text).await.is_err());

        let mismatched = record_bins(2, Bin::Int(0));
        assert!(backend.put(&ctx, Set::Metrics, 3, mismatched).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_from_many_tasks() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileBackend::open_with_slots(dir.path(), 2).unwrap());

        let writers: Vec<_> = (0..8_i64)
            .map(|w| {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move {
                    let ctx = Context::background();
                    for i in 0..16 {
                        let ts = w * 100 + i;
                        backend
                            .put(&ctx, Set::Metrics, ts, record_bins(ts, Bin::Int(i)))
                            .await
                            .unwrap();
                    }
                    let counter = Bins::from([(BIN_COUNTER.to_string(), Bin::Int(w))]);
                    backend.put(&ctx, Set::Counter, w, counter).await.unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        backend.close().await.unwrap();

        let reopened = FileBackend::open(dir.path()).unwrap();
        let stats = reopened.stats().unwrap();
        assert_eq!(stats.records, 128);
        assert_eq!(stats.oldest, Some(0));
        assert_eq!(stats.newest, Some(715));
        let ctx = Context::background();
        assert_eq!(
            reopened.get(&ctx, Set::Counter, 7).await.unwrap(),
            Some(Bins::from([(BIN_COUNTER.to_string(), Bin::Int(7))]))
        );
    }

    #[tokio::test]
    async fn test_counter_set_persists_as_json() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        let bins = Bins::from([(BIN_COUNTER.to_string(), Bin::Int(42))]);

        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.put(&ctx, Set::Counter, 0, bins.clone()).await.unwrap();
        }

        assert!(dir.path().join(COUNTER_FILE).exists());
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.get(&ctx, Set::Counter, 0).await.unwrap(), Some(bins));
    }

    #[tokio::test]
    async fn test_corrupted_counter_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(COUNTER_FILE), "{ not json").unwrap();

        let err = FileBackend::open(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RrdError::Backend(BackendError::Json { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_directory_is_unavailable() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"").unwrap();

        let err = FileBackend::open(blocker.join("store")).unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_minimum_reduction_uses_index() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        let backend = FileBackend::open(dir.path()).unwrap();
        for ts in [50, 20, 80] {
            backend
                .put(&ctx, Set::Metrics, ts, record_bins(ts, Bin::Int(ts)))
                .await
                .unwrap();
        }

        let min = backend
            .reduce(&ctx, Set::Metrics, &Reduction::MinimumOf(BIN_TIMESTAMP.to_string()))
            .await
            .unwrap();
        assert_eq!(min, Some(record_bins(20, Bin::Int(20))));
    }
}
