//! Rawdata migration tool.
//!
//! Reads a legacy dataset extract, transforms each record (or key group)
//! into a message with a JSON manifest and an entry payload, optionally
//! encrypts both, and publishes the messages to a topic in source order.
//!
//! # Usage
//!
//! ```bash
//! # Structured JSON extract
//! rawdata-migrate --topic kostra json --spec kostra.yaml --input ./kostra/
//!
//! # Delimited extract, deduplicated and grouped through RocksDB
//! rawdata-migrate --topic karakter \
//!     --encryption-key "$KEY" --encryption-salt "$SALT" \
//!     delimited --spec karakter.yaml --input ./karakter/ --store ./data/karakter
//!
//! # Look at what was written
//! rawdata-migrate inspect ./rawdata/karakter/karakter-000000000.rawdata.gz
//! ```
//!
//! Every global option can also be set through the environment variable
//! shown in `--help`.

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use metrics::gauge;
use rawdata_core::metrics::{RUNNING, init_metrics, start_metrics_server};
use rawdata_core::{ENTRY_SEGMENT, MANIFEST_SEGMENT, PayloadCipher};
use rawdata_migrate::log::read_segment_file;
use rawdata_migrate::{
    DatasetSpec, DelimitedDatasetWorker, JsonDatasetWorker, LogProvider, MigrationWorker,
    ProduceStats, TargetConfig, open_client,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Migrate legacy dataset extracts into an ordered message log.
#[derive(Parser, Debug)]
#[command(name = "rawdata-migrate")]
#[command(about = "Migrate legacy dataset extracts into an ordered message log")]
#[command(version)]
struct Args {
    #[command(flatten)]
    target: TargetArgs,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "METRICS_PORT", default_value = "0")]
    metrics_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate a structured JSON dataset
    Json {
        /// Dataset description (YAML)
        #[arg(long)]
        spec: PathBuf,

        /// Input file or directory
        #[arg(short, long)]
        input: PathBuf,

        /// Limit number of files to process (for testing)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Migrate a delimited dataset through the key store
    Delimited {
        /// Dataset description (YAML) with a `key` section
        #[arg(long)]
        spec: PathBuf,

        /// Input file or directory
        #[arg(short, long)]
        input: PathBuf,

        /// RocksDB path for the key store
        #[arg(long)]
        store: PathBuf,

        /// Produce from an already prepared key store
        #[arg(long)]
        skip_prepare: bool,

        /// Limit number of files to process (for testing)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print the envelopes of a segment file
    Inspect {
        /// Segment file (`.rawdata` or `.rawdata.gz`)
        file: PathBuf,

        /// Decrypt manifests with the configured key and salt
        #[arg(long)]
        decrypt: bool,
    },
}

/// Target options shared by every subcommand.
#[derive(ClapArgs, Debug)]
struct TargetArgs {
    /// Topic to publish to
    #[arg(long, env = "RAWDATA_TOPIC")]
    topic: Option<String>,

    /// Log provider (segment or memory)
    #[arg(long, env = "RAWDATA_CLIENT_PROVIDER", default_value = "segment")]
    provider: LogProvider,

    /// Encryption passphrase (needs --encryption-salt)
    #[arg(long, env = "RAWDATA_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,

    /// Encryption salt (needs --encryption-key)
    #[arg(long, env = "RAWDATA_ENCRYPTION_SALT", hide_env_values = true)]
    encryption_salt: Option<String>,

    /// Base directory for segment files
    #[arg(long, env = "LOCAL_TEMP_FOLDER", default_value = "./rawdata")]
    local_temp_folder: PathBuf,

    /// Seal a segment after this many seconds
    #[arg(long, env = "RAWDATA_FILE_MAX_SECONDS")]
    max_seconds: Option<u64>,

    /// Seal a segment at this size in bytes
    #[arg(long, env = "RAWDATA_FILE_MAX_BYTES", default_value = "67108864")] // 64 MiB
    max_bytes: usize,

    /// Messages between segment fsyncs
    #[arg(long, env = "RAWDATA_FILE_SYNC_INTERVAL", default_value = "1000")]
    sync_interval: usize,

    /// Outstanding-work queue capacity
    #[arg(long, env = "PRODUCER_QUEUE_CAPACITY", default_value = "1000")]
    queue_capacity: usize,

    /// Transform worker threads (default: number of CPUs)
    #[arg(long, env = "WORKER_THREADS")]
    worker_threads: Option<usize>,

    /// Seconds to wait for workers on shutdown
    #[arg(long, default_value = "30")]
    shutdown_timeout_secs: u64,

    /// Disable gzip compression of sealed segments
    #[arg(long)]
    no_compress: bool,
}

impl TargetArgs {
    fn cipher(&self) -> PayloadCipher {
        PayloadCipher::from_secret(self.encryption_key.clone(), self.encryption_salt.clone())
    }

    fn into_config(self) -> Result<TargetConfig> {
        let defaults = TargetConfig::default();
        let config = TargetConfig {
            topic: self.topic.context("--topic (or RAWDATA_TOPIC) is required")?,
            provider: self.provider,
            encryption_key: self.encryption_key,
            encryption_salt: self.encryption_salt,
            local_temp_folder: self.local_temp_folder,
            max_seconds: self.max_seconds,
            max_bytes: self.max_bytes,
            sync_interval: self.sync_interval,
            queue_capacity: self.queue_capacity,
            worker_threads: self.worker_threads.unwrap_or(defaults.worker_threads),
            compress: !self.no_compress,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,rawdata_migrate=debug")),
        )
        .init();

    let args = Args::parse();

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        gauge!(RUNNING).set(1.0);
    }

    let result = run(args);
    gauge!(RUNNING).set(0.0);
    result
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Json { spec, input, limit } => {
            let dataset = load_spec(&spec)?;
            let target = args.target.into_config()?;
            info!("Migrating {} to topic {}", input.display(), target.topic);

            let client = open_client(&target)?;
            let mut worker = JsonDatasetWorker::new(&dataset, input, target, client)
                .context("Failed to start JSON worker")?
                .with_limit(limit);
            run_worker(&mut worker, false)
        }
        Command::Delimited {
            spec,
            input,
            store,
            skip_prepare,
            limit,
        } => {
            let dataset = load_spec(&spec)?;
            let target = args.target.into_config()?;
            info!(
                "Migrating {} to topic {} via key store {}",
                input.display(),
                target.topic,
                store.display()
            );

            let client = open_client(&target)?;
            let mut worker = DelimitedDatasetWorker::new(&dataset, input, &store, target, client)
                .context("Failed to start delimited worker")?
                .with_limit(limit);
            run_worker(&mut worker, !skip_prepare)
        }
        Command::Inspect { file, decrypt } => {
            let cipher = decrypt.then(|| args.target.cipher());
            inspect(&file, cipher.as_ref())
        }
    }
}

fn load_spec(path: &Path) -> Result<DatasetSpec> {
    DatasetSpec::from_yaml_file(path)
        .with_context(|| format!("Failed to load dataset description {}", path.display()))
}

/// Prepare, produce and close a worker, then log a summary.
///
/// The worker is closed even when produce fails; the produce error wins.
fn run_worker<W: MigrationWorker>(worker: &mut W, prepare: bool) -> Result<()> {
    let start = Instant::now();

    if prepare {
        worker.prepare().context("Prepare failed")?;
        info!("Prepare finished in {:.1}s", start.elapsed().as_secs_f64());
    }

    let produced = worker.produce().context("Produce failed");
    let closed = worker.close().context("Close failed");
    let stats = produced?;
    closed?;

    print_summary(&stats, start.elapsed());
    Ok(())
}

fn print_summary(stats: &ProduceStats, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        stats.published as f64 / secs
    } else {
        0.0
    };

    info!("═══════════════════════════════════════════════════════════");
    info!("Migration complete");
    info!("  Files:               {}", stats.files);
    info!("  Bytes read:          {}", stats.bytes_read);
    info!("  Records:             {}", stats.records);
    info!("  Messages submitted:  {}", stats.messages);
    info!("  Messages published:  {}", stats.published);
    info!("  Backpressure drains: {}", stats.backpressure_drains);
    info!("  Elapsed:             {:.1}s ({:.0} msg/s)", secs, rate);
    info!("═══════════════════════════════════════════════════════════");
}

fn inspect(path: &Path, cipher: Option<&PayloadCipher>) -> Result<()> {
    if let Some(cipher) = cipher
        && !cipher.is_enabled()
    {
        bail!("--decrypt needs both --encryption-key and --encryption-salt");
    }

    let messages = read_segment_file(path)
        .with_context(|| format!("Failed to read segment file {}", path.display()))?;

    for message in &messages {
        let manifest = message
            .segment(MANIFEST_SEGMENT)
            .with_context(|| format!("Position {} has no manifest", message.position))?;
        let manifest = match cipher {
            Some(cipher) => cipher
                .decrypt(manifest)
                .with_context(|| format!("Failed to decrypt position {}", message.position))?,
            None => manifest.to_vec(),
        };
        let entry_len = message.segment(ENTRY_SEGMENT).map_or(0, <[u8]>::len);

        println!(
            "{}\t{}\t{} entry bytes",
            message.position,
            String::from_utf8_lossy(&manifest),
            entry_len
        );
    }

    info!("{} messages in {}", messages.len(), path.display());
    Ok(())
}
