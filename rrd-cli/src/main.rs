//! CLI for the rrd round-robin point store.
//!
//! Provides commands for inspecting, querying, writing to, and benchmarking
//! rrd stores.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use rrd::backend::file::{COUNTER_FILE, RECORDS_FILE};
use rrd::config::DEFAULT_MAX_RECORDS;
use rrd::{
    Backend, Context, FileBackend, MemoryBackend, MetricValue, Record, RecordStore, Storage,
    StorageConfig, validate_range,
};

/// rrd — Fixed-capacity round-robin time-series point store CLI.
#[derive(Parser)]
#[command(name = "rrd", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display slab usage, record count, and the stored time span.
    Info {
        /// Path to the store directory.
        store_path: PathBuf,
    },

    /// Read the records in a timestamp range.
    Query {
        /// Path to the store directory.
        store_path: PathBuf,

        /// First timestamp to include. `--start 0 --end 0` reads everything up to now.
        #[arg(long, default_value_t = 0)]
        start: i64,

        /// Last timestamp to include.
        #[arg(long, default_value_t = 0)]
        end: i64,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Write one record, evicting the oldest if the store is full.
    Put {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Record timestamp.
        timestamp: i64,

        /// Record value; integers are stored as integers.
        value: String,

        /// Store capacity.
        #[arg(long, default_value_t = DEFAULT_MAX_RECORDS)]
        max_records: u64,
    },

    /// Run a write-path microbenchmark against the in-memory backend.
    Bench {
        /// Number of records to write.
        #[arg(long, default_value = "1000000")]
        points: u64,

        /// Store capacity.
        #[arg(long, default_value_t = DEFAULT_MAX_RECORDS)]
        max_records: u64,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { store_path } => cmd_info(&store_path).await,
        Commands::Query {
            store_path,
            start,
            end,
            format,
        } => cmd_query(&store_path, start, end, &format).await,
        Commands::Put {
            store_path,
            timestamp,
            value,
            max_records,
        } => cmd_put(&store_path, timestamp, &value, max_records).await,
        Commands::Bench {
            points,
            max_records,
        } => cmd_bench(points, max_records).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Opens an existing store directory.
fn open_existing(store_path: &Path) -> Result<Arc<FileBackend>, Box<dyn std::error::Error>> {
    if !store_path.join(RECORDS_FILE).exists() {
        return Err(format!("No store found at '{}'", store_path.display()).into());
    }
    Ok(Arc::new(FileBackend::open(store_path)?))
}

/// Implements `rrd info <store_path>`.
async fn cmd_info(store_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_existing(store_path)?;
    let ctx = Context::background();
    let stats = backend.stats()?;
    let persisted = RecordStore::new(backend.clone()).read_counter(&ctx).await?;

    println!("Store: {}", store_path.display());
    println!();
    println!(
        "Slab: {} ({})",
        store_path.join(RECORDS_FILE).display(),
        format_bytes(stats.slab_bytes)
    );
    println!("  Slots: {} used / {} allocated", stats.records, stats.slot_count);
    println!("Records: {}", stats.records);
    match persisted {
        Some(count) => println!("Persisted counter: {count}"),
        None => println!("Persisted counter: none"),
    }
    if store_path.join(COUNTER_FILE).exists() {
        println!("  File: {}", store_path.join(COUNTER_FILE).display());
    }
    if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
        println!("Oldest timestamp: {oldest}");
        println!("Newest timestamp: {newest}");
    }

    backend.close().await?;
    Ok(())
}

/// Implements `rrd query <store_path>`.
async fn cmd_query(
    store_path: &Path,
    start: i64,
    end: i64,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    validate_range(start, end)?;
    let backend = open_existing(store_path)?;
    let ctx = Context::background();

    let range = rrd::TimeRange::new(start, end).resolve();
    let mut records = RecordStore::new(backend.clone())
        .range_query(&ctx, range.min, range.max)
        .await?;
    records.sort_by_key(|r| r.timestamp);

    match format {
        OutputFormat::Csv => {
            println!("# start={}, end={}, records={}", range.min, range.max, records.len());
            println!("timestamp,metric_value");
            for record in &records {
                println!("{},{}", record.timestamp, record.value);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    backend.close().await?;
    Ok(())
}

/// Implements `rrd put <store_path> <timestamp> <value>`.
async fn cmd_put(
    store_path: &Path,
    timestamp: i64,
    value: &str,
    max_records: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let value = parse_value(value)?;
    let ctx = Context::background();
    let backend = Arc::new(FileBackend::open(store_path)?);
    let storage = Storage::open(backend, StorageConfig::new(max_records), &ctx).await?;

    let written = storage.set(&ctx, Record::new(timestamp, value)).await;
    storage.close(&ctx).await?;
    written?;

    println!(
        "Stored {timestamp},{value} ({} / {} records)",
        storage.count(),
        storage.max_records()
    );
    Ok(())
}

/// Implements `rrd bench`.
#[allow(clippy::cast_precision_loss)] // Benchmark stats are fine with f64 precision
async fn cmd_bench(points: u64, max_records: u64) -> Result<(), Box<dyn std::error::Error>> {
    println!("rrd write-path benchmark");
    println!("  Points: {points}");
    println!("  Max records: {max_records}");
    println!();

    let ctx = Context::background();
    let backend = Arc::new(MemoryBackend::new());
    let storage = Storage::open(backend.clone(), StorageConfig::new(max_records), &ctx).await?;

    println!("Writing {points} records...");

    let base_time = 1_700_000_000_000_000_i64;
    let start = Instant::now();

    for i in 0..i64::try_from(points)? {
        storage.set(&ctx, Record::new(base_time + i, i)).await?;
    }

    let elapsed = start.elapsed();
    let ns_per_write = elapsed.as_nanos() as f64 / points.max(1) as f64;
    let writes_per_sec = points as f64 / elapsed.as_secs_f64();
    let stored = backend.len(rrd::backend::Set::Metrics)?;

    println!();
    println!("Results:");
    println!("  Total writes: {points}");
    println!("  Elapsed: {elapsed:.3?}");
    println!("  Avg latency: {ns_per_write:.1} ns/write");
    println!("  Throughput: {writes_per_sec:.0} writes/sec");
    println!("  Stored records: {stored} (tracked {})", storage.count());
    println!();

    storage.close(&ctx).await?;
    Ok(())
}

/// Parses a record value, keeping integers exact.
fn parse_value(s: &str) -> Result<MetricValue, Box<dyn std::error::Error>> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Ok(MetricValue::Int(i));
    }
    let f: f64 = s.parse().map_err(|_| format!("Invalid value: '{s}'"))?;
    if !f.is_finite() {
        return Err(format!("Value must be finite: '{s}'").into());
    }
    Ok(MetricValue::Float(f))
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
