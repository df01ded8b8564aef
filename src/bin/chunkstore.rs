//! Chunkstore operator binary
//!
//! Inspect and exercise a chunk store data directory from the shell.
//!
//! # Examples
//!
//! ```bash
//! # Store a file as one chunk
//! chunkstore --data-dir /var/lib/chunks put ./block.bin
//!
//! # Read it back
//! chunkstore --data-dir /var/lib/chunks get 9f86d081... -o out.bin
//!
//! # Per-shard capacity and free slots
//! chunkstore shards
//!
//! # Concurrent put/get/delete load
//! chunkstore bench --chunks 10000 --concurrency 8
//! ```

use anyhow::Context;
use chunkstore::metrics::export_metrics;
use chunkstore::{Address, Chunk, Store, StoreConfig, WorkerPool};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Content-addressed chunk store
#[derive(Parser, Debug)]
#[command(name = "chunkstore")]
#[command(version = chunkstore::VERSION)]
#[command(about = "Content-addressed chunk store over sharded slot files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory path (overrides the config file)
    #[arg(long, global = true, env = "CHUNKSTORE_DATA")]
    data_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "CHUNKSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of shard files
    #[arg(long, global = true)]
    shard_count: Option<u8>,

    /// Slot size in bytes
    #[arg(long, global = true)]
    max_chunk_size: Option<usize>,

    /// Disable the read cache
    #[arg(long, global = true)]
    no_cache: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Also write logs to daily rolling files in this directory
    #[arg(long, global = true, env = "CHUNKSTORE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a file as a single chunk
    Put {
        /// File to read the payload from
        file: PathBuf,
    },

    /// Fetch a chunk by address
    Get {
        /// Hex address
        address: Address,
        /// Write the payload here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a chunk by address
    Delete {
        /// Hex address
        address: Address,
    },

    /// Check whether a chunk is stored
    Has {
        /// Hex address
        address: Address,
    },

    /// Number of stored chunks
    Count,

    /// Capacity and free slots per shard
    Shards,

    /// Shard the next put would go to
    NextShard,

    /// Verify index and shard free lists agree
    Check,

    /// Run a concurrent put/get/delete workload
    Bench(BenchArgs),

    /// Print metrics in the Prometheus text format
    Metrics,
}

#[derive(Args, Debug)]
struct BenchArgs {
    /// Number of chunks to write
    #[arg(long, default_value = "1000")]
    chunks: usize,

    /// Concurrent workers
    #[arg(long, default_value = "8")]
    concurrency: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let config = load_config(&cli)?;
    let store = Store::open(config).context("Failed to open chunk store")?;

    let result = run_command(&store, cli.command);
    if let Err(e) = store.close() {
        warn!("Failed to close chunk store: {}", e);
    }
    result
}

fn run_command(store: &Store, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Put { file } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let chunk = Chunk::new(data);
            let shard = store.put(&chunk)?;
            println!("{} shard={}", chunk.address(), shard);
        }
        Commands::Get { address, output } => {
            let chunk = store.get(&address)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, chunk.data())
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Wrote {} bytes to {}", chunk.len(), path.display());
                }
                None => std::io::stdout().write_all(chunk.data())?,
            }
        }
        Commands::Delete { address } => {
            store.delete(&address)?;
            println!("Deleted {}", address);
        }
        Commands::Has { address } => {
            println!("{}", store.has(&address)?);
        }
        Commands::Count => {
            println!("{}", store.count()?);
        }
        Commands::Shards => {
            println!("{:>5}  {:>14}  {:>10}", "shard", "capacity", "free slots");
            println!("───────────────────────────────────");
            for info in store.shard_size()? {
                println!(
                    "{:>5}  {:>14}  {:>10}",
                    info.shard, info.capacity, info.free_slots
                );
            }
        }
        Commands::NextShard => {
            println!("{}", store.next_shard()?);
        }
        Commands::Check => {
            let report = store.check()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.leaked > 0 {
                warn!(leaked = report.leaked, "Store has leaked slots");
            }
        }
        Commands::Bench(args) => bench_command(store, args)?,
        Commands::Metrics => {
            print!("{}", export_metrics());
        }
    }
    Ok(())
}

/// Layer defaults, config file and flags into one configuration
fn load_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let mut config = StoreConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.storage_path = dir.clone();
    }
    if let Some(count) = cli.shard_count {
        config.shard_count = count;
    }
    if let Some(size) = cli.max_chunk_size {
        config.max_chunk_size = size;
    }
    if cli.no_cache {
        config.cache_enabled = false;
    }
    config.validate()?;
    Ok(config)
}

/// Setup logging to stderr, plus rolling files when a log dir is given
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let file_layer = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "chunkstore.log");
            Some(fmt::layer().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Put, read back and delete `chunks` distinct payloads
fn bench_command(store: &Store, args: BenchArgs) -> anyhow::Result<()> {
    let pool = WorkerPool::new(args.concurrency)?;
    let size = store.config().max_chunk_size;

    // Seed payloads with the start time so repeated runs don't dedupe
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let chunks: Vec<Chunk> = (0..args.chunks as u64)
        .map(|i| Chunk::new(bench_payload(seed, i, size)))
        .collect();

    info!(
        chunks = args.chunks,
        concurrency = args.concurrency,
        chunk_size = size,
        "Starting benchmark"
    );

    let start = Instant::now();
    pool.try_run(chunks.iter().collect(), |c| store.put(c))?;
    report("put", args.chunks, start.elapsed());

    let start = Instant::now();
    pool.try_run(chunks.iter().collect(), |c| {
        let got = store.get(c.address())?;
        if got.data() != c.data() {
            return Err(chunkstore::Error::Inconsistent(format!(
                "payload mismatch for {}",
                c.address()
            )));
        }
        Ok(())
    })?;
    report("get", args.chunks, start.elapsed());

    let start = Instant::now();
    pool.try_run(chunks.iter().collect(), |c| store.delete(c.address()))?;
    report("delete", args.chunks, start.elapsed());

    let check = store.check()?;
    println!(
        "check: entries={} free={} leaked={}",
        check.entries, check.free, check.leaked
    );
    Ok(())
}

fn bench_payload(seed: u64, n: u64, size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut block = Address::of(&[seed.to_le_bytes(), n.to_le_bytes()].concat());
    while data.len() < size {
        data.extend_from_slice(block.as_bytes());
        block = Address::of(block.as_bytes());
    }
    data.truncate(size);
    data
}

fn report(op: &str, count: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { count as f64 / secs } else { 0.0 };
    println!(
        "{:<6} {:>8} ops in {:>8.3}s  ({:.0} ops/s)",
        op, count, secs, rate
    );
}
