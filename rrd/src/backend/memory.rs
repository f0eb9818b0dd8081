//! In-process backend over ordered maps.
//!
//! Used by tests and by servers started without a storage path. Nothing
//! survives the process.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{Backend, Bins, RangeFilter, Reduction, Set, Written};
use crate::context::Context;
use crate::error::{BackendError, Result, UnavailableError};

/// Backend keeping every set in a `BTreeMap` behind an `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    sets: RwLock<Sets>,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct Sets {
    metrics: BTreeMap<i64, Bins>,
    counter: BTreeMap<i64, Bins>,
}

impl Sets {
    fn get(&self, set: Set) -> &BTreeMap<i64, Bins> {
        match set {
            Set::Metrics => &self.metrics,
            Set::Counter => &self.counter,
        }
    }

    fn get_mut(&mut self, set: Set) -> &mut BTreeMap<i64, Bins> {
        match set {
            Set::Metrics => &mut self.metrics,
            Set::Counter => &mut self.counter,
        }
    }
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries in `set`.
    ///
    /// # Errors
    ///
    /// Fails if the backend is closed.
    pub fn len(&self, set: Set) -> Result<usize> {
        Ok(self.read("len")?.get(set).len())
    }

    /// Returns true if `set` has no entries.
    ///
    /// # Errors
    ///
    /// Fails if the backend is closed.
    pub fn is_empty(&self, set: Set) -> Result<bool> {
        Ok(self.len(set)? == 0)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UnavailableError::Closed.into());
        }
        Ok(())
    }

    fn read(&self, operation: &'static str) -> Result<RwLockReadGuard<'_, Sets>> {
        self.ensure_open()?;
        self.sets
            .read()
            .map_err(|_| BackendError::Poisoned { operation }.into())
    }

    fn write(&self, operation: &'static str) -> Result<RwLockWriteGuard<'_, Sets>> {
        self.ensure_open()?;
        self.sets
            .write()
            .map_err(|_| BackendError::Poisoned { operation }.into())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn put(&self, ctx: &Context, set: Set, key: i64, bins: Bins) -> Result<Written> {
        ctx.check("put")?;
        let mut sets = self.write("put")?;
        Ok(match sets.get_mut(set).insert(key, bins) {
            Some(_) => Written::Replaced,
            None => Written::Created,
        })
    }

    async fn get(&self, ctx: &Context, set: Set, key: i64) -> Result<Option<Bins>> {
        ctx.check("get")?;
        Ok(self.read("get")?.get(set).get(&key).cloned())
    }

    async fn delete(&self, ctx: &Context, set: Set, key: i64) -> Result<bool> {
        ctx.check("delete")?;
        Ok(self.write("delete")?.get_mut(set).remove(&key).is_some())
    }

    async fn scan(&self, ctx: &Context, set: Set, filter: &RangeFilter) -> Result<Vec<Bins>> {
        ctx.check("scan")?;
        filter.validate()?;
        let sets = self.read("scan")?;
        sets
            .get(set)
            .values()
            .filter_map(|bins| match filter.select(bins) {
                Ok(true) => Some(Ok(bins.clone())),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            })
            .collect()
    }

    async fn reduce(
        &self,
        ctx: &Context,
        set: Set,
        reduction: &Reduction,
    ) -> Result<Option<Bins>> {
        ctx.check("reduce")?;
        let sets = self.read("reduce")?;
        Ok(reduction.apply(sets.get(set).values())?.cloned())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BIN_TIMESTAMP, Bin};

    fn entry(ts: i64) -> Bins {
        Bins::from([(BIN_TIMESTAMP.to_string(), Bin::Int(ts))])
    }

    #[tokio::test]
    async fn test_put_reports_created_then_replaced() {
        let backend = MemoryBackend::new();
        let ctx = Context::background();

        let first = backend.put(&ctx, Set::Metrics, 1, entry(1)).await.unwrap();
        let second = backend.put(&ctx, Set::Metrics, 1, entry(1)).await.unwrap();

        assert_eq!(first, Written::Created);
        assert_eq!(second, Written::Replaced);
        assert_eq!(backend.len(Set::Metrics).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sets_are_independent() {
        let backend = MemoryBackend::new();
        let ctx = Context::background();

        backend.put(&ctx, Set::Counter, 0, entry(0)).await.unwrap();

        assert!(backend.is_empty(Set::Metrics).unwrap());
        assert!(backend.get(&ctx, Set::Metrics, 0).await.unwrap().is_none());
        assert!(backend.get(&ctx, Set::Counter, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_absent_key_is_not_an_error() {
        let backend = MemoryBackend::new();
        let ctx = Context::background();
        assert!(!backend.delete(&ctx, Set::Metrics, 42).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_context_touches_nothing() {
        let backend = MemoryBackend::new();
        let ctx = Context::background();
        ctx.cancel();

        let err = backend.put(&ctx, Set::Metrics, 1, entry(1)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(backend.is_empty(Set::Metrics).unwrap());
    }

    #[tokio::test]
    async fn test_closed_backend_is_unavailable() {
        let backend = MemoryBackend::new();
        backend.close().await.unwrap();

        let err = backend
            .scan(&Context::background(), Set::Metrics, &RangeFilter::all(BIN_TIMESTAMP))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_reduce_finds_global_minimum() {
        let backend = MemoryBackend::new();
        let ctx = Context::background();
        for ts in [40, 10, 30, 20] {
            backend.put(&ctx, Set::Metrics, ts, entry(ts)).await.unwrap();
        }

        let min = backend
            .reduce(&ctx, Set::Metrics, &Reduction::MinimumOf(BIN_TIMESTAMP.to_string()))
            .await
            .unwrap();
        assert_eq!(min, Some(entry(10)));
    }
}
