use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use embedstream::config::{LogArgs, StoreArgs, StreamArgs};
use embedstream::{
    telemetry, ChangeProducer, FeedStart, FileCheckpoint, JsonlChangeFeed, ProducerConfig,
    Shutdown,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "embedstream-producer",
    about = "Tails the source change log into the stage-1 stream"
)]
struct ProducerCli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    streams: StreamArgs,

    #[command(flatten)]
    log: LogArgs,

    /// Append-only JSONL change log written by the source store
    #[arg(long, env = "EMBEDSTREAM_CHANGE_LOG", default_value = "changes.jsonl")]
    change_log: PathBuf,

    /// File holding the last appended resume position
    #[arg(
        long,
        env = "EMBEDSTREAM_CHECKPOINT",
        default_value = "producer.checkpoint"
    )]
    checkpoint: PathBuf,

    /// Read the whole change log from the start when no checkpoint exists
    #[arg(long, env = "EMBEDSTREAM_FROM_BEGINNING", default_value_t = false)]
    from_beginning: bool,

    /// Ignore the checkpoint and re-read the whole change log
    #[arg(long, default_value_t = false)]
    resync: bool,

    /// Milliseconds one poll of the change log waits for new lines
    #[arg(long, env = "EMBEDSTREAM_POLL_MS", default_value_t = 1_000)]
    poll_ms: u64,

    /// Consecutive change-feed failures tolerated before exiting
    #[arg(long, env = "EMBEDSTREAM_MAX_RECONNECTS", default_value_t = 10)]
    max_reconnects: u32,

    /// First reconnect delay in milliseconds
    #[arg(long, env = "EMBEDSTREAM_RECONNECT_BASE_MS", default_value_t = 1_000)]
    reconnect_base_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[arg(long, env = "EMBEDSTREAM_RECONNECT_MAX_MS", default_value_t = 60_000)]
    reconnect_max_ms: u64,

    /// Stage-1 length kept by periodic trimming (0 disables trimming)
    #[arg(long, env = "EMBEDSTREAM_TRIM_MAX_LEN", default_value_t = 10_000)]
    trim_max_len: u64,

    /// Appends between two trims
    #[arg(long, env = "EMBEDSTREAM_TRIM_EVERY", default_value_t = 10_000)]
    trim_every: u64,
}

impl ProducerCli {
    fn producer_config(&self) -> ProducerConfig {
        let initial_start = if self.from_beginning || self.resync {
            FeedStart::Beginning
        } else {
            FeedStart::Now
        };
        ProducerConfig {
            initial_start,
            resync: self.resync,
            poll_timeout: Duration::from_millis(self.poll_ms.max(1)),
            base_backoff: Duration::from_millis(self.reconnect_base_ms),
            max_backoff: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_base_ms)),
            max_reconnects: self.max_reconnects,
            trim_max_len: (self.trim_max_len > 0).then_some(self.trim_max_len),
            trim_every: self.trim_every.max(1),
        }
    }
}

fn main() -> Result<()> {
    let cli = ProducerCli::parse();
    telemetry::init(&cli.log.log_level);

    let shutdown = Shutdown::new();
    shutdown
        .install_signal_handlers()
        .context("failed to install signal handlers")?;
    let store = cli.store.open()?;
    let stream = store.stream(cli.streams.changes_stream.as_str());
    info!(
        change_log = %cli.change_log.display(),
        checkpoint = %cli.checkpoint.display(),
        stream = stream.name(),
        "starting change producer"
    );

    let mut producer = ChangeProducer::new(
        JsonlChangeFeed::new(&cli.change_log),
        FileCheckpoint::new(&cli.checkpoint),
        stream,
        cli.producer_config(),
        shutdown,
    );
    let result = producer.run();
    store.close();
    match result {
        Ok(stats) => {
            info!(
                appended = stats.appended,
                reconnects = stats.reconnects,
                trimmed = stats.trimmed,
                "change producer finished"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, class = ?err.class(), "change producer halted");
            Err(err).context("change producer halted")
        }
    }
}
