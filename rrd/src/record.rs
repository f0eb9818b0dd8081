//! The record data model.
//!
//! A [`Record`] is a single `(timestamp, value)` sample. The timestamp is a
//! microsecond Unix epoch and is the record's only key. The value is a
//! [`MetricValue`], which the store carries verbatim and never does
//! arithmetic on.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A single timestamped metric sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Microseconds since the Unix epoch. Unique key of the record.
    pub timestamp: i64,
    /// The sample value.
    #[serde(rename = "metric_value")]
    pub value: MetricValue,
}

impl Record {
    /// Creates a record.
    pub fn new(timestamp: i64, value: impl Into<MetricValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

/// The numeric encodings a record value may use.
///
/// Serialized untagged, so JSON integers decode as [`MetricValue::Int`] and
/// anything with a fraction or exponent as [`MetricValue::Float`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// A signed 64-bit integer.
    Int(i64),
    /// A 64-bit float.
    Float(f64),
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Returns the current wall-clock time in microseconds since the Unix epoch.
///
/// Clocks set before the epoch read as 0.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
