//! Backing-store contract consumed by the record store adapter.
//!
//! A backend is a keyed store of named [`Bins`] grouped into [`Set`]s. The
//! store core only needs five primitives from it: point write, point read,
//! point delete, an inclusive range scan over an integer bin, and a
//! server-side reduction that returns the entry with the smallest value of a
//! bin. How a backend provides them (an ordered map, an index over a slab
//! file, a remote aggregation) is its own business.
//!
//! Every primitive takes a [`Context`]; implementations must call
//! [`Context::check`] before doing any I/O.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryBackend`] — process-local ordered maps
//! - [`FileBackend`] — a memory-mapped record slab plus a JSON counter file

pub mod file;
pub mod memory;
pub mod slab;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::Result;

pub use file::FileBackend;
pub use memory::MemoryBackend;

/// Bin holding a record's timestamp.
pub const BIN_TIMESTAMP: &str = "timestamp";

/// Bin holding a record's value.
pub const BIN_METRIC_VALUE: &str = "metric_value";

/// Bin holding the persisted capacity counter.
pub const BIN_COUNTER: &str = "counter";

/// A keyspace inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Set {
    /// Time-series records, keyed by timestamp.
    Metrics,
    /// Out-of-band bookkeeping such as the persisted capacity counter.
    Counter,
}

impl Set {
    /// Returns the set's name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Counter => "counter",
        }
    }
}

impl fmt::Display for Set {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single stored field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bin {
    /// Integer bin.
    Int(i64),
    /// Floating-point bin.
    Float(f64),
    /// String bin.
    Text(String),
}

impl Bin {
    /// Returns the integer payload, if this is an integer bin.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns a short name of the bin's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "string",
        }
    }
}

/// The named fields stored under one key.
pub type Bins = BTreeMap<String, Bin>;

/// Result of a `put`: whether the key already existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Written {
    /// The key was not present before.
    Created,
    /// An existing entry under the key was overwritten.
    Replaced,
}

/// Inclusive range filter over an integer bin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFilter {
    /// The bin to filter on.
    pub bin: String,
    /// Lower bound, inclusive.
    pub min: i64,
    /// Upper bound, inclusive.
    pub max: i64,
}

impl RangeFilter {
    /// Creates a filter matching `min <= bins[bin] <= max`.
    pub fn new(bin: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            bin: bin.into(),
            min,
            max,
        }
    }

    /// Returns a filter matching every integer value of `bin`.
    pub fn all(bin: impl Into<String>) -> Self {
        Self::new(bin, i64::MIN, i64::MAX)
    }

    /// Returns true if the integer `bin` of `bins` lies inside the range.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Filter`](crate::error::BackendError::Filter)
    /// if `bins` has no integer `bin`; a scan never drops such an entry
    /// silently.
    pub fn select(&self, bins: &Bins) -> Result<bool> {
        let Some(value) = bins.get(&self.bin).and_then(Bin::as_int) else {
            return Err(crate::error::BackendError::Filter {
                bin: self.bin.clone(),
                min: self.min,
                max: self.max,
                reason: format!("entry has no integer '{}' bin", self.bin),
            }
            .into());
        };
        Ok(value >= self.min && value <= self.max)
    }

    /// Rejects inverted ranges.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Filter`](crate::error::BackendError::Filter)
    /// if `min > max`.
    pub fn validate(&self) -> Result<()> {
        if self.min > self.max {
            return Err(crate::error::BackendError::Filter {
                bin: self.bin.clone(),
                min: self.min,
                max: self.max,
                reason: "lower bound is greater than upper bound".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// A server-side fold that yields at most one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reduction {
    /// The entry with the smallest integer value of the named bin.
    MinimumOf(String),
}

impl Reduction {
    /// Returns the reduction's name.
    pub fn name(&self) -> String {
        match self {
            Self::MinimumOf(bin) => format!("min({bin})"),
        }
    }

    /// Folds `entries` down to the selected entry.
    ///
    /// Every entry must hold the reduced bin as an integer; a single
    /// entry without one fails the whole reduction, since skipping it
    /// could hide the true minimum.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Reduction`](crate::error::BackendError::Reduction)
    /// naming the first entry that cannot be compared.
    pub fn apply<'a, I>(&self, entries: I) -> Result<Option<&'a Bins>>
    where
        I: IntoIterator<Item = &'a Bins>,
    {
        let Self::MinimumOf(bin) = self;
        let mut best: Option<(i64, &'a Bins)> = None;
        for bins in entries {
            let Some(value) = bins.get(bin).and_then(Bin::as_int) else {
                return Err(crate::error::BackendError::Reduction {
                    name: self.name(),
                    reason: format!("entry has no integer '{bin}' bin"),
                }
                .into());
            };
            if best.is_none_or(|(current, _)| value < current) {
                best = Some((value, bins));
            }
        }
        Ok(best.map(|(_, bins)| bins))
    }
}

/// Primitives a backing store must provide.
///
/// Implementations are shared between concurrent writers and readers, so
/// every method takes `&self`.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Upserts `bins` under `key`, never expiring.
    async fn put(&self, ctx: &Context, set: Set, key: i64, bins: Bins) -> Result<Written>;

    /// Reads the entry under `key`.
    async fn get(&self, ctx: &Context, set: Set, key: i64) -> Result<Option<Bins>>;

    /// Deletes the entry under `key`. Returns whether anything was removed;
    /// deleting an absent key is not an error.
    async fn delete(&self, ctx: &Context, set: Set, key: i64) -> Result<bool>;

    /// Returns every entry matching `filter`, in no particular order.
    async fn scan(&self, ctx: &Context, set: Set, filter: &RangeFilter) -> Result<Vec<Bins>>;

    /// Runs `reduction` over every entry of `set`.
    async fn reduce(
        &self,
        ctx: &Context,
        set: Set,
        reduction: &Reduction,
    ) -> Result<Option<Bins>>;

    /// Flushes pending state and refuses further operations.
    async fn close(&self) -> Result<()>;
}
