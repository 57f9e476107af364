//! Command-line argument groups shared by the pipeline binaries.
//!
//! Each binary flattens the groups it needs; every flag also reads an
//! `EMBEDSTREAM_*` environment variable.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tracing::{info, warn};

use crate::consumer::RetryPolicy;
use crate::embedder::encode::EncodeServiceClient;
use crate::embedder::openai::OpenAiEmbedder;
use crate::embedder::EmbeddingService;
use crate::stream::{StoreOptions, StreamStore};

/// Location and limits of the stream store.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// SQLite file holding every stream
    #[arg(long, env = "EMBEDSTREAM_STORE", default_value = "embedstream.db")]
    pub store: PathBuf,

    /// Maximum entries per stream before appends fail (unbounded when unset)
    #[arg(long, env = "EMBEDSTREAM_MAX_ENTRIES")]
    pub max_entries: Option<u64>,

    /// Milliseconds between checks for entries appended by other processes
    #[arg(long, env = "EMBEDSTREAM_POLL_INTERVAL_MS", default_value_t = 100)]
    pub poll_interval_ms: u64,
}

impl StoreArgs {
    /// Opens the configured store.
    pub fn open(&self) -> Result<StreamStore> {
        let options = StoreOptions {
            max_entries: self.max_entries,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            ..StoreOptions::default()
        };
        StreamStore::open(&self.store, options)
            .with_context(|| format!("failed to open stream store {:?}", self.store))
    }
}

/// Names of the two pipeline streams.
#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    /// Stage-1 stream of change events
    #[arg(long, env = "EMBEDSTREAM_CHANGES_STREAM", default_value = "raw_document_changes")]
    pub changes_stream: String,

    /// Stage-2 stream of embedded documents
    #[arg(long, env = "EMBEDSTREAM_EMBEDDED_STREAM", default_value = "embedded_documents")]
    pub embedded_stream: String,
}

/// Redelivery policy of a consumer group.
#[derive(Args, Debug, Clone)]
pub struct RetryArgs {
    /// Idle milliseconds before a failed entry is retried the first time
    #[arg(long, env = "EMBEDSTREAM_BASE_BACKOFF_MS", default_value_t = 1_000)]
    pub base_backoff_ms: u64,

    /// Cap on the doubling retry backoff
    #[arg(long, env = "EMBEDSTREAM_MAX_BACKOFF_MS", default_value_t = 300_000)]
    pub max_backoff_ms: u64,

    /// Deliveries after which a failing entry is dead-lettered
    #[arg(long, env = "EMBEDSTREAM_MAX_DELIVERIES", default_value_t = 5)]
    pub max_deliveries: u32,

    /// Idle milliseconds before another consumer's pending entry may be claimed
    #[arg(long, env = "EMBEDSTREAM_CLAIM_IDLE_MS", default_value_t = 60_000)]
    pub claim_idle_ms: u64,
}

impl RetryArgs {
    /// Policy described by these flags.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.base_backoff_ms)),
            max_deliveries: self.max_deliveries.max(1),
        }
    }

    /// Takeover threshold for entries owned by other consumers.
    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }
}

/// Worker-pool sizing.
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Consumer threads in this process
    #[arg(long, env = "EMBEDSTREAM_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Consumer name prefix; names become `<prefix>-<pid>-<n>`
    #[arg(long, env = "EMBEDSTREAM_CONSUMER_PREFIX")]
    pub consumer_prefix: Option<String>,

    /// Milliseconds an empty read blocks
    #[arg(long, env = "EMBEDSTREAM_BLOCK_MS", default_value_t = 5_000)]
    pub block_ms: u64,

    /// Milliseconds a partial batch waits for more entries
    #[arg(long, env = "EMBEDSTREAM_MAX_WAIT_MS", default_value_t = 500)]
    pub max_wait_ms: u64,

    /// Milliseconds shutdown waits for workers stuck in a downstream call
    #[arg(long, env = "EMBEDSTREAM_SHUTDOWN_GRACE_MS", default_value_t = 2_000)]
    pub shutdown_grace_ms: u64,
}

impl WorkerArgs {
    /// Consumer name prefix, `default` when unset.
    pub fn prefix<'a>(&'a self, default: &'a str) -> &'a str {
        self.consumer_prefix.as_deref().unwrap_or(default)
    }

    /// How long shutdown waits for busy workers.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Logging verbosity.
#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "EMBEDSTREAM_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Embedding backend selector.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Backend {
    /// Self-hosted service exposing `/encode` and `/encode_batch`.
    Encode,
    /// OpenAI-compatible `/embeddings` API.
    Openai,
}

/// Embedding service connection.
#[derive(Args, Debug, Clone)]
pub struct EmbeddingArgs {
    /// Which embedding API to call
    #[arg(long, env = "EMBEDSTREAM_BACKEND", value_enum, default_value_t = Backend::Encode)]
    pub backend: Backend,

    /// Base URL of the embedding service
    #[arg(long, env = "EMBEDSTREAM_EMBEDDING_URL", default_value = "http://localhost:8080")]
    pub embedding_url: String,

    /// Seconds to wait for one embedding request
    #[arg(long, env = "EMBEDSTREAM_EMBEDDING_TIMEOUT_SECS", default_value_t = 30)]
    pub embedding_timeout_secs: u64,

    /// Expected vector width; mismatches fail the batch
    #[arg(long, env = "EMBEDSTREAM_DIMENSIONS")]
    pub dimensions: Option<usize>,

    /// API key for the OpenAI backend
    #[arg(long, env = "OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,

    /// Model for the OpenAI backend
    #[arg(long, env = "EMBEDSTREAM_OPENAI_MODEL", default_value = "text-embedding-3-small")]
    pub openai_model: String,
}

impl EmbeddingArgs {
    /// Builds the selected client.
    pub fn connect(&self, batch_size: usize) -> Result<Box<dyn EmbeddingService + Sync>> {
        let timeout = Duration::from_secs(self.embedding_timeout_secs.max(1));
        Ok(match self.backend {
            Backend::Encode => {
                let client = EncodeServiceClient::new(
                    &self.embedding_url,
                    timeout,
                    self.dimensions,
                    batch_size,
                )?;
                // Startup check only; the workers tolerate an absent service.
                match client.health() {
                    Ok(health) => info!(
                        status = %health.status,
                        model = health.model.as_deref().unwrap_or("-"),
                        vector_size = ?health.vector_size,
                        "embedding service reachable"
                    ),
                    Err(err) => warn!(error = %err, "embedding service health check failed"),
                }
                Box::new(client)
            }
            Backend::Openai => Box::new(OpenAiEmbedder::new(
                self.openai_api_key.clone().unwrap_or_default(),
                self.embedding_url.clone(),
                self.openai_model.clone(),
                self.dimensions,
                timeout,
                batch_size,
            )?),
        })
    }
}

/// Splits a comma separated flag value.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
