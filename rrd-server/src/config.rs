//! Process configuration, read from flags or the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rrd::StorageConfig;
use rrd::config::DEFAULT_MAX_RECORDS;

/// rrd-server — HTTP front end for a fixed-capacity point store.
#[derive(Parser, Debug, Clone)]
#[command(name = "rrd-server", version, about)]
pub struct ServerConfig {
    /// Log filter, e.g. `info` or `rrd=debug,rrd_server=trace`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Port for the HTTP API.
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Maximum number of records held at once.
    #[arg(long, env = "STORAGE_CAP", default_value_t = DEFAULT_MAX_RECORDS)]
    pub storage_cap: u64,

    /// Store directory. Records are kept in memory when unset.
    #[arg(long, env = "STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    /// Recount stored records at startup instead of trusting the persisted counter.
    #[arg(
        long,
        env = "RECONCILE_ON_OPEN",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub reconcile_on_open: bool,

    /// Per-request deadline in seconds.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 15)]
    pub request_timeout_secs: u64,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable lines.
    Text,
}

impl ServerConfig {
    /// Returns the engine configuration.
    pub fn storage(&self) -> StorageConfig {
        StorageConfig {
            max_records: self.storage_cap,
            reconcile_on_open: self.reconcile_on_open,
        }
    }

    /// Returns the per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::try_parse_from(["rrd-server"]).unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.storage_cap, 1000);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.storage_path.is_none());
        assert!(config.reconcile_on_open);
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = ServerConfig::try_parse_from([
            "rrd-server",
            "--storage-cap",
            "5",
            "--storage-path",
            "/tmp/rrd",
            "--reconcile-on-open",
            "false",
            "--log-format",
            "text",
        ])
        .unwrap();

        assert_eq!(config.storage(), StorageConfig {
            max_records: 5,
            reconcile_on_open: false,
        });
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/rrd")));
        assert_eq!(config.log_format, LogFormat::Text);
    }
}
