//! Boundary contract between transports and the storage engine.
//!
//! [`RrdService`] is what a transport calls. It collapses every engine
//! failure into one of two uniform outcomes, "record not created" and
//! "range query failed", while keeping the underlying error as the source
//! for logging.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::Context;
use crate::error::RrdError;
use crate::record::Record;
use crate::storage::Storage;

/// Failure reported to transports.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The write failed; nothing was stored.
    #[error("record not created")]
    NotCreated {
        /// Timestamp of the rejected record.
        timestamp: i64,
        /// What went wrong.
        #[source]
        source: RrdError,
    },

    /// The range read failed.
    #[error("range query failed")]
    RangeQueryFailed {
        /// Requested start.
        start: i64,
        /// Requested end.
        end: i64,
        /// What went wrong.
        #[source]
        source: RrdError,
    },
}

impl ServiceError {
    /// Returns the engine error behind this failure.
    pub fn cause(&self) -> &RrdError {
        match self {
            Self::NotCreated { source, .. } | Self::RangeQueryFailed { source, .. } => source,
        }
    }
}

/// Write side of the boundary.
#[async_trait]
pub trait RecordSetter: Send + Sync {
    /// Stores `record`.
    async fn create(&self, ctx: &Context, record: Record) -> Result<(), ServiceError>;
}

/// Read side of the boundary.
#[async_trait]
pub trait RecordGetter: Send + Sync {
    /// Returns the records in `[start, end]`; `(0, 0)` means everything up
    /// to now. The caller has already checked `0 <= start <= end`.
    async fn get_by_range(
        &self,
        ctx: &Context,
        start: i64,
        end: i64,
    ) -> Result<Vec<Record>, ServiceError>;
}

/// The service backed by a [`Storage`] engine.
#[derive(Debug, Clone)]
pub struct RrdService {
    storage: Arc<Storage>,
}

impl RrdService {
    /// Wraps a storage engine.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Returns the wrapped engine.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

#[async_trait]
impl RecordSetter for RrdService {
    async fn create(&self, ctx: &Context, record: Record) -> Result<(), ServiceError> {
        self.storage
            .set(ctx, record)
            .await
            .map_err(|source| ServiceError::NotCreated {
                timestamp: record.timestamp,
                source,
            })
    }
}

#[async_trait]
impl RecordGetter for RrdService {
    async fn get_by_range(
        &self,
        ctx: &Context,
        start: i64,
        end: i64,
    ) -> Result<Vec<Record>, ServiceError> {
        self.storage
            .get_by_range(ctx, start, end)
            .await
            .map_err(|source| ServiceError::RangeQueryFailed { start, end, source })
    }
}
