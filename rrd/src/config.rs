//! Storage engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default record capacity.
pub const DEFAULT_MAX_RECORDS: u64 = 1000;

/// Configuration for [`Storage`](crate::storage::Storage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Maximum number of records held at once. Must be > 0.
    pub max_records: u64,

    /// Recount the stored records when opening instead of trusting the
    /// persisted counter.
    ///
    /// The persisted counter is written best-effort after each admission,
    /// so a crash between an insert and its persistence leaves it behind
    /// the true count. Recounting costs one full scan at startup.
    pub reconcile_on_open: bool,
}

impl StorageConfig {
    /// Creates a configuration with the given capacity and defaults for
    /// everything else.
    pub fn new(max_records: u64) -> Self {
        Self {
            max_records,
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMaxRecords`] if `max_records` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_records == 0 {
            return Err(ConfigError::InvalidMaxRecords {
                value: self.max_records,
            }
            .into());
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            reconcile_on_open: true,
        }
    }
}
