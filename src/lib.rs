#![warn(missing_docs)]
//! Durable two-stage pipeline from a source change feed, through an embedding
//! service, into a vector index.
//!
//! ```text
//! change feed ─► producer ─► [stage-1 stream] ─► embedding consumers
//!                                                      │
//!   vector index ◄─ upsert consumers ◄─ [stage-2 stream] ◄┘
//! ```
//!
//! Every arrow into a stream is a durable boundary: each side may be down
//! without affecting the other, and unacknowledged work is redelivered.

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod embedder;
pub mod error;
pub mod event;
pub mod index;
pub mod monitor;
pub mod producer;
pub mod shutdown;
pub mod source;
pub mod stream;
pub mod telemetry;

pub use checkpoint::{CheckpointError, CheckpointStore, FileCheckpoint, MemoryCheckpoint};
pub use clock::{Clock, ManualClock, SystemClock};
pub use consumer::{
    EmbeddingConsumer, EmbeddingConsumerConfig, GroupMember, RetryPolicy, StepOutcome,
    UpsertConsumer, UpsertConsumerConfig, WorkerState, WorkerStats,
};
pub use embedder::{EmbeddingService, ServiceError};
pub use error::{ErrorClass, PipelineError};
pub use event::{
    Change, ChangeEvent, DeadLetter, EmbeddedDocument, EmbeddingVersion, Operation, Payload,
    ResumePosition, SourceTimestamp,
};
pub use index::{IndexError, MemoryIndex, QdrantIndex, VectorIndex};
pub use monitor::{BackpressureSignal, LagMonitor, LagReport, MonitorThresholds, SignalKind};
pub use producer::{ChangeProducer, ProducerConfig, ProducerStats};
pub use shutdown::Shutdown;
pub use source::{ChangeFeed, ChangeStream, FeedError, FeedStart, JsonlChangeFeed, SourceChange};
pub use stream::{
    Delivery, DueRule, GroupStart, PendingEntry, StoreOptions, Stream, StreamEntry, StreamError, StreamId,
    StreamStore,
};
