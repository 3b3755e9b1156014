//! `compressiond`: operator daemon that ingests records, drives the
//! batching state machine, and submits sealed commitments to a chain sink.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use compression_core::{
    Batcher, BatchCommitment, CommitSink, Config, Id, RecordInput, RecordKind, Signature, Stats,
};
use compression_store::build_store;
use prometheus::Encoder;
use serde::{Deserialize, Serialize};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Clone)]
struct DaemonMetrics {
    registry: prometheus::Registry,
    records_total: prometheus::IntCounterVec,
    enqueue_errors_total: prometheus::IntCounterVec,
    batches_sealed_total: prometheus::IntCounter,
    batch_commit_errors_total: prometheus::IntCounter,
    batch_latency_ms: prometheus::Histogram,
    queue_depth: prometheus::IntGauge,
}

impl DaemonMetrics {
    fn new() -> Self {
        let registry = prometheus::Registry::new();
        let records_total = prometheus::IntCounterVec::new(
            prometheus::Opts::new("compressiond_records_total", "Total records enqueued"),
            &["channel"],
        )
        .unwrap();
        let enqueue_errors_total = prometheus::IntCounterVec::new(
            prometheus::Opts::new(
                "compressiond_enqueue_errors_total",
                "Enqueue errors by channel",
            ),
            &["channel"],
        )
        .unwrap();
        let batches_sealed_total = prometheus::IntCounter::new(
            "compressiond_batches_sealed_total",
            "Total batches sealed and submitted",
        )
        .unwrap();
        let batch_commit_errors_total = prometheus::IntCounter::new(
            "compressiond_batch_commit_errors_total",
            "Batches whose commit sink rejected them",
        )
        .unwrap();
        let batch_latency_ms = prometheus::Histogram::with_opts(prometheus::HistogramOpts::new(
            "compressiond_batch_commit_latency_ms",
            "Time from flush to commit sink response, in milliseconds",
        ))
        .unwrap();
        let queue_depth = prometheus::IntGauge::new(
            "compressiond_queue_depth",
            "Records buffered in the currently open batch",
        )
        .unwrap();

        registry.register(Box::new(records_total.clone())).unwrap();
        registry
            .register(Box::new(enqueue_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(batches_sealed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(batch_commit_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(batch_latency_ms.clone()))
            .unwrap();
        registry.register(Box::new(queue_depth.clone())).unwrap();

        Self {
            registry,
            records_total,
            enqueue_errors_total,
            batches_sealed_total,
            batch_commit_errors_total,
            batch_latency_ms,
            queue_depth,
        }
    }

    fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

struct StatusState {
    metrics: DaemonMetrics,
    batcher: Arc<Batcher>,
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    queue_len: usize,
    total_batches: u64,
    total_records: u64,
    last_commit_at: Option<u64>,
}

impl From<Stats> for HealthReport {
    fn from(stats: Stats) -> Self {
        Self {
            status: "ok",
            queue_len: stats.queue_len,
            total_batches: stats.total_batches,
            total_records: stats.total_records,
            last_commit_at: stats.last_commit_at,
        }
    }
}

/// `compressiond` command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase output verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Override log level (e.g. info, debug, trace).
    #[arg(long, env = "COMPRESSIOND_LOG_LEVEL")]
    log_level: Option<String>,
    /// HTTP bind address for metrics and health endpoints. `off`/`disabled`
    /// turns the status server off entirely.
    #[arg(
        long,
        env = "COMPRESSIOND_STATUS_ADDR",
        default_value = "127.0.0.1:9090",
        help = "Bind address for /metrics and /healthz"
    )]
    status_addr: String,
    /// Path to the JSON configuration envelope; defaults baked in if absent.
    #[arg(long, env = "COMPRESSIOND_CONFIG", value_name = "FILE")]
    config: Option<String>,
    /// Subcommand.
    #[command(subcommand)]
    command: Commands,
}

/// Commands for compressiond.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the batching daemon, reading newline-delimited JSON records from
    /// a file until EOF, then flush and exit.
    Daemon {
        /// Path to a newline-delimited JSON file of record entries; `-`
        /// reads from stdin.
        #[arg(short, long, default_value = "-")]
        input: String,
    },
    /// Enqueue a single record from a JSON file and print its commitment.
    /// Batching is forced off so the record flushes immediately.
    Enqueue {
        /// JSON file containing a single record entry.
        #[arg(short, long)]
        file: String,
    },
}

/// Wire shape of a caller-supplied record, decoded from CLI input and
/// converted into `RecordInput`. Kept separate from `RecordInput` because
/// the latter carries raw bytes, not hex.
#[derive(Debug, Deserialize)]
struct RecordInputWire {
    channel: String,
    sender: String,
    kind: RecordKind,
    #[serde(default)]
    reply_to: Option<String>,
    content: String,
}

impl RecordInputWire {
    fn into_record_input(self) -> anyhow::Result<RecordInput> {
        let channel = parse_id(&self.channel)?;
        let sender = parse_id(&self.sender)?;
        let reply_to = self
            .reply_to
            .as_deref()
            .map(compression_core::Digest::from_hex)
            .transpose()
            .map_err(|e| anyhow::anyhow!("bad reply_to: {e}"))?;
        Ok(RecordInput {
            channel,
            sender,
            content_bytes: self.content.into_bytes(),
            kind: self.kind,
            reply_to,
        })
    }
}

fn parse_id(s: &str) -> anyhow::Result<Id> {
    let bytes = hex::decode(s)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("id must be 32 bytes hex"))?;
    Ok(Id::from_bytes(arr))
}

/// Placeholder chain sink: logs the commitment and returns a deterministic
/// signature derived from the root, standing in for the on-chain submission
/// path this daemon does not implement.
struct LoggingSink;

#[async_trait::async_trait]
impl CommitSink for LoggingSink {
    async fn commit(&self, commitment: &BatchCommitment) -> anyhow::Result<Signature> {
        info!(
            batch_id = commitment.batch_id,
            root = %commitment.root.to_hex(),
            leaves = commitment.leaves.len(),
            "submitting batch commitment"
        );
        let mut sig = [0u8; 64];
        sig[..32].copy_from_slice(commitment.root.as_bytes());
        sig[32] = 0xC0;
        Ok(Signature(sig))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = cli
        .log_level
        .as_deref()
        .map(|lvl| lvl.to_ascii_uppercase())
        .map(|lvl| match lvl.as_str() {
            "TRACE" => Level::TRACE,
            "DEBUG" => Level::DEBUG,
            "INFO" => Level::INFO,
            _ => Level::INFO,
        })
        .unwrap_or_else(|| match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        });
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_env_filter(env_filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref()).await?;
    let storage = build_store(&config.storage)?;

    match cli.command {
        Commands::Daemon { input } => daemon(config, storage, input, cli.status_addr).await,
        Commands::Enqueue { file } => enqueue_one(config, storage, file).await,
    }
}

async fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            let bytes = tokio::fs::read(path).await?;
            Ok(Config::from_json(&bytes)?)
        }
        None => Ok(Config::default()),
    }
}

async fn daemon(
    config: Config,
    storage: Arc<dyn compression_core::ObjectStore>,
    input: String,
    status_addr: String,
) -> anyhow::Result<()> {
    let batcher = Batcher::new(config.to_batcher_config(0), storage, Arc::new(LoggingSink));
    let metrics = DaemonMetrics::new();
    let status_state = Arc::new(StatusState {
        metrics: metrics.clone(),
        batcher: Arc::clone(&batcher),
    });

    let status_listener = match status_addr.as_str() {
        "off" | "disabled" => None,
        _ => Some(tokio::net::TcpListener::bind(&status_addr).await?),
    };
    if let Some(listener) = status_listener {
        let addr = listener.local_addr()?;
        tokio::spawn(start_status_server(listener, status_state));
        info!("status/metrics server listening on {addr}");
    } else {
        info!("status/metrics server disabled");
    }

    let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> = if input == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(tokio::fs::File::open(&input).await?)
    };
    let mut lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(reader));

    info!("compressiond daemon started");
    while let Some(line) = tokio::io::AsyncBufReadExt::next_line(&mut lines).await? {
        if line.trim().is_empty() {
            continue;
        }
        let wire: RecordInputWire = match serde_json::from_str(&line) {
            Ok(w) => w,
            Err(err) => {
                tracing::error!(error = %err, "skipping malformed input line");
                continue;
            }
        };
        let channel_label = wire.channel.clone();
        let record_input = match wire.into_record_input() {
            Ok(r) => r,
            Err(err) => {
                metrics
                    .enqueue_errors_total
                    .with_label_values(&[channel_label.as_str()])
                    .inc();
                tracing::error!(error = %err, "skipping invalid record");
                continue;
            }
        };

        let start = Instant::now();
        let batches_before = batcher.stats().await.total_batches;
        match batcher.enqueue(record_input).await {
            Ok(handle) => {
                metrics
                    .records_total
                    .with_label_values(&[channel_label.as_str()])
                    .inc();
                let stats = batcher.stats().await;
                metrics.queue_depth.set(stats.queue_len as i64);
                if stats.total_batches > batches_before {
                    metrics.batches_sealed_total.inc();
                    metrics
                        .batch_latency_ms
                        .observe(start.elapsed().as_millis() as f64);
                }
                info!(
                    batch_id = handle.batch_id,
                    leaf_index = handle.leaf_index,
                    "enqueued record"
                );
            }
            Err(err) => {
                metrics.batch_commit_errors_total.inc();
                metrics
                    .enqueue_errors_total
                    .with_label_values(&[channel_label.as_str()])
                    .inc();
                tracing::error!(error = %err, "enqueue failed");
            }
        }
    }

    batcher.shutdown().await?;
    info!("input exhausted, pending records flushed, shutting down");
    Ok(())
}

async fn enqueue_one(
    config: Config,
    storage: Arc<dyn compression_core::ObjectStore>,
    file: String,
) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(&file).await?;
    let wire: RecordInputWire = serde_json::from_slice(&bytes)?;
    let record_input = wire.into_record_input()?;

    let mut batcher_config = config.to_batcher_config(0);
    batcher_config.batching_enabled = false;
    let batcher = Batcher::new(batcher_config, storage, Arc::new(LoggingSink));
    let handle = batcher.enqueue(record_input).await?;
    println!(
        "batch_id={} leaf_index={} content_hash={}",
        handle.batch_id,
        handle.leaf_index,
        handle.content_hash.to_hex()
    );
    Ok(())
}

async fn start_status_server(listener: tokio::net::TcpListener, state: Arc<StatusState>) {
    let app = Router::new()
        .route("/metrics", get(metrics_endpoint))
        .route("/healthz", get(health_endpoint))
        .with_state(state);

    if let Err(err) = axum::serve(listener, app.into_make_service()).await {
        tracing::warn!(error = %err, "status server terminated");
    }
}

async fn metrics_endpoint(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn health_endpoint(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    let stats = state.batcher.stats().await;
    Json(HealthReport::from(stats))
}
