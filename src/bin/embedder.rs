use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use embedstream::config::{
    split_list, EmbeddingArgs, LogArgs, RetryArgs, StoreArgs, StreamArgs, WorkerArgs,
};
use embedstream::consumer::{consumer_name, run_pool};
use embedstream::{telemetry, EmbeddingConsumer, EmbeddingConsumerConfig, EmbeddingService, Shutdown};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "embedstream-embedder",
    about = "Embeds stage-1 change events into the stage-2 stream"
)]
struct EmbedderCli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    streams: StreamArgs,

    #[command(flatten)]
    retry: RetryArgs,

    #[command(flatten)]
    workers: WorkerArgs,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    log: LogArgs,

    /// Consumer group on the stage-1 stream
    #[arg(long, env = "EMBEDSTREAM_EMBED_GROUP", default_value = "embedding_processors")]
    group: String,

    /// Change events per embedding call
    #[arg(long, env = "EMBEDSTREAM_EMBED_BATCH", default_value_t = 5)]
    batch_size: usize,

    /// Payload fields joined into the embedded text, comma separated
    #[arg(long, env = "EMBEDSTREAM_TEXT_FIELDS", default_value = "subject,body")]
    text_fields: String,

    /// Payload fields kept as metadata, comma separated (whole payload when unset)
    #[arg(long, env = "EMBEDSTREAM_METADATA_FIELDS")]
    metadata_fields: Option<String>,
}

impl EmbedderCli {
    fn consumer_config(&self) -> EmbeddingConsumerConfig {
        EmbeddingConsumerConfig {
            input_stream: self.streams.changes_stream.clone(),
            group: self.group.clone(),
            output_stream: self.streams.embedded_stream.clone(),
            batch_size: self.batch_size.max(1),
            max_wait: Duration::from_millis(self.workers.max_wait_ms),
            block_timeout: Duration::from_millis(self.workers.block_ms),
            retry: self.retry.policy(),
            claim_idle: self.retry.claim_idle(),
            text_fields: split_list(&self.text_fields),
            metadata_fields: self.metadata_fields.as_deref().map(split_list),
            dimensions: self.embedding.dimensions,
        }
    }
}

fn main() -> Result<()> {
    let cli = EmbedderCli::parse();
    telemetry::init(&cli.log.log_level);
    anyhow::ensure!(
        !split_list(&cli.text_fields).is_empty(),
        "--text-fields must name at least one field"
    );

    let shutdown = Shutdown::new();
    shutdown
        .install_signal_handlers()
        .context("failed to install signal handlers")?;
    let service: Arc<dyn EmbeddingService + Sync> =
        Arc::from(cli.embedding.connect(cli.batch_size.max(1))?);
    let store = cli.store.open()?;
    let config = cli.consumer_config();
    let prefix = cli.workers.prefix("embedder");

    let workers = (0..cli.workers.workers.max(1))
        .map(|slot| {
            EmbeddingConsumer::new(
                &store,
                consumer_name(prefix, slot),
                Arc::clone(&service),
                config.clone(),
                shutdown.clone(),
            )
        })
        .collect::<Result<Vec<_>, _>>()
        .context("failed to join the embedding consumer group")?;
    info!(
        workers = workers.len(),
        backend = ?cli.embedding.backend,
        stream = %config.input_stream,
        group = %config.group,
        "starting embedding consumers"
    );

    let result = run_pool(workers, &shutdown, cli.workers.shutdown_grace());
    store.close();
    let stats = result?;
    info!(
        acked = stats.acked,
        written = stats.written,
        failed = stats.failed,
        dead_lettered = stats.dead_lettered,
        "embedding consumers finished"
    );
    Ok(())
}
