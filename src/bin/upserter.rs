use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use embedstream::config::{LogArgs, RetryArgs, StoreArgs, StreamArgs, WorkerArgs};
use embedstream::consumer::{consumer_name, run_pool};
use embedstream::{telemetry, QdrantIndex, Shutdown, UpsertConsumer, UpsertConsumerConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "embedstream-upserter",
    about = "Applies stage-2 embedded documents to the Qdrant index"
)]
struct UpserterCli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    streams: StreamArgs,

    #[command(flatten)]
    retry: RetryArgs,

    #[command(flatten)]
    workers: WorkerArgs,

    #[command(flatten)]
    log: LogArgs,

    /// Consumer group on the stage-2 stream
    #[arg(long, env = "EMBEDSTREAM_UPSERT_GROUP", default_value = "qdrant_upserters")]
    group: String,

    /// Embedded documents per index round trip
    #[arg(long, env = "EMBEDSTREAM_UPSERT_BATCH", default_value_t = 10)]
    batch_size: usize,

    /// Qdrant REST endpoint
    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Qdrant API key
    #[arg(long, env = "QDRANT_API_KEY")]
    qdrant_api_key: Option<String>,

    /// Collection holding document vectors
    #[arg(long, env = "EMBEDSTREAM_COLLECTION", default_value = "documents")]
    collection: String,

    /// Vector width; creates missing collections and rejects mismatched vectors
    #[arg(long, env = "EMBEDSTREAM_DIMENSIONS")]
    dimensions: Option<usize>,

    /// Seconds to wait for one Qdrant request
    #[arg(long, env = "EMBEDSTREAM_QDRANT_TIMEOUT_SECS", default_value_t = 30)]
    qdrant_timeout_secs: u64,
}

impl UpserterCli {
    fn consumer_config(&self) -> UpsertConsumerConfig {
        UpsertConsumerConfig {
            input_stream: self.streams.embedded_stream.clone(),
            group: self.group.clone(),
            batch_size: self.batch_size.max(1),
            max_wait: Duration::from_millis(self.workers.max_wait_ms),
            block_timeout: Duration::from_millis(self.workers.block_ms),
            retry: self.retry.policy(),
            claim_idle: self.retry.claim_idle(),
            dimensions: self.dimensions,
        }
    }
}

fn main() -> Result<()> {
    let cli = UpserterCli::parse();
    telemetry::init(&cli.log.log_level);

    let shutdown = Shutdown::new();
    shutdown
        .install_signal_handlers()
        .context("failed to install signal handlers")?;
    let index = QdrantIndex::new(
        &cli.qdrant_url,
        &cli.collection,
        cli.qdrant_api_key.as_deref(),
        Duration::from_secs(cli.qdrant_timeout_secs.max(1)),
    )?;
    match cli.dimensions {
        Some(dimensions) => index
            .ensure_collections(dimensions)
            .with_context(|| format!("failed to prepare collection {}", cli.collection))?,
        None => {
            if let Err(err) = index.ensure_tombstones() {
                warn!(collection = %cli.collection, error = %err, "tombstone collection not prepared yet");
            }
        }
    }
    match index.points_count() {
        Ok(points) => info!(collection = %cli.collection, points, "vector index reachable"),
        Err(err) => warn!(collection = %cli.collection, error = %err, "vector index not reachable yet"),
    }
    let store = cli.store.open()?;
    let config = cli.consumer_config();
    let prefix = cli.workers.prefix("upserter");

    let workers = (0..cli.workers.workers.max(1))
        .map(|slot| {
            UpsertConsumer::new(
                &store,
                consumer_name(prefix, slot),
                index.clone(),
                config.clone(),
                shutdown.clone(),
            )
        })
        .collect::<Result<Vec<_>, _>>()
        .context("failed to join the upsert consumer group")?;
    info!(
        workers = workers.len(),
        collection = %cli.collection,
        stream = %config.input_stream,
        group = %config.group,
        "starting upsert consumers"
    );

    let result = run_pool(workers, &shutdown, cli.workers.shutdown_grace());
    store.close();
    let stats = result?;
    info!(
        acked = stats.acked,
        written = stats.written,
        skipped = stats.skipped,
        dead_lettered = stats.dead_lettered,
        "upsert consumers finished"
    );
    Ok(())
}
