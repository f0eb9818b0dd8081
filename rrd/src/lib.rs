//! # rrd
//!
//! Fixed-capacity round-robin time-series point store.
//!
//! Clients append `(timestamp, value)` samples and read them back by
//! timestamp range. The store holds at most `max_records` samples; once
//! full, every new sample evicts the single oldest one, so the store
//! behaves like a time-ordered circular buffer rather than a growing log.
//!
//! ## Key Properties
//!
//! - Bounded size, set by configuration rather than data volume
//! - Timestamp is the only key; a repeated timestamp overwrites (last write wins)
//! - Pluggable backing store behind the [`Backend`] trait
//! - Every operation honors a caller [`Context`] and fails fast once it is done
//! - No global write lock: writers racing at the cap may overshoot briefly
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rrd::{Context, FileBackend, Record, Storage, StorageConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = Context::background();
//! let backend = Arc::new(FileBackend::open("./rrd_data")?);
//! let storage = Storage::open(backend, StorageConfig::new(1000), &ctx).await?;
//!
//! storage.set(&ctx, Record::new(rrd::now_micros(), 85.5)).await?;
//!
//! // (0, 0) reads everything up to now
//! for record in storage.get_by_range(&ctx, 0, 0).await? {
//!     println!("{}: {}", record.timestamp, record.value);
//! }
//! storage.close(&ctx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Storage`] — the engine: capacity check, eviction, insert, range read
//! - [`RecordStore`] — record encoding over the backend primitives
//! - [`CapacityTracker`] — atomic, capped record count
//! - [`Backend`] — point write/read/delete, range scan, minimum reduction
//! - [`RrdService`] — the transport-facing contract with uniform errors
//!
//! ## Modules
//!
//! - [`storage`] — engine lifecycle, write path, range reads
//! - [`adapter`] — record store adapter
//! - [`capacity`] — capacity tracker
//! - [`eviction`] — oldest-first eviction
//! - [`query`] — range bounds and the `(0, 0)` convention
//! - [`backend`] — backing-store trait and the memory and file backends
//! - [`service`] — transport boundary
//! - [`context`] — cancellation contexts
//! - [`config`] — engine configuration
//! - [`record`] — the record data model
//! - [`error`] — error types

pub mod adapter;
pub mod backend;
pub mod capacity;
pub mod config;
pub mod context;
pub mod error;
pub mod eviction;
pub mod query;
pub mod record;
pub mod service;
pub mod storage;

// Re-export primary API types at crate root for convenience.
pub use adapter::RecordStore;
pub use backend::{Backend, FileBackend, MemoryBackend};
pub use capacity::CapacityTracker;
pub use config::StorageConfig;
pub use context::Context;
pub use error::{Result, RrdError};
pub use query::{TimeRange, validate_range};
pub use record::{MetricValue, Record, now_micros};
pub use service::{RecordGetter, RecordSetter, RrdService, ServiceError};
pub use storage::Storage;
