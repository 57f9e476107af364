#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use embedstream::consumer::{EmbeddingConsumerConfig, UpsertConsumerConfig};
use embedstream::index::{IndexDeletion, IndexRecord, SearchMatch};
use embedstream::{
    Change, ChangeEvent, EmbeddedDocument, EmbeddingConsumer, EmbeddingService,
    EmbeddingVersion, IndexError, ManualClock, MemoryIndex, Payload, ResumePosition,
    ServiceError, Shutdown, SourceTimestamp, StepOutcome, StoreOptions, StreamId, StreamStore,
    UpsertConsumer, VectorIndex,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const STAGE1: &str = "raw_document_changes";
pub const STAGE2: &str = "embedded_documents";
pub const EMBED_GROUP: &str = "embedding_processors";
pub const UPSERT_GROUP: &str = "qdrant_upserters";

/// Embedding service whose output depends only on the input text.
#[derive(Default)]
pub struct FakeEmbedder {
    /// Inputs containing this marker fail the whole call.
    pub fail_marker: Mutex<Option<String>>,
    /// Every call fails while set.
    pub down: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn failing_on(marker: &str) -> Self {
        Self {
            fail_marker: Mutex::new(Some(marker.to_string())),
            ..Self::default()
        }
    }
}

pub fn vector_for(text: &str) -> Vec<f32> {
    let sum: u32 = text.bytes().map(u32::from).sum();
    vec![text.len() as f32, (sum % 97) as f32, 1.0]
}

impl EmbeddingService for FakeEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable("connection refused".into()));
        }
        if let Some(marker) = self.fail_marker.lock().as_deref() {
            if inputs.iter().any(|text| text.contains(marker)) {
                return Err(ServiceError::Unavailable("model crashed".into()));
            }
        }
        Ok(inputs.iter().map(|text| vector_for(text)).collect())
    }
}

/// Memory index that can be switched off.
#[derive(Default)]
pub struct FlakyIndex {
    pub inner: MemoryIndex,
    pub down: AtomicBool,
}

impl FlakyIndex {
    fn check(&self) -> Result<(), IndexError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(IndexError::Unavailable("index offline".into()));
        }
        Ok(())
    }
}

impl VectorIndex for FlakyIndex {
    fn applied_version(
        &self,
        document_id: &str,
    ) -> Result<Option<EmbeddingVersion>, IndexError> {
        self.check()?;
        self.inner.applied_version(document_id)
    }

    fn upsert(&self, records: &[IndexRecord]) -> Result<(), IndexError> {
        self.check()?;
        self.inner.upsert(records)
    }

    fn delete(&self, deletions: &[IndexDeletion]) -> Result<(), IndexError> {
        self.check()?;
        self.inner.delete(deletions)
    }

    fn upsert_if_newer(&self, records: &[IndexRecord]) -> Result<usize, IndexError> {
        self.check()?;
        self.inner.upsert_if_newer(records)
    }

    fn delete_if_newer(&self, deletions: &[IndexDeletion]) -> Result<usize, IndexError> {
        self.check()?;
        self.inner.delete_if_newer(deletions)
    }

    fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchMatch>, IndexError> {
        self.check()?;
        self.inner.search(vector, limit)
    }
}

pub fn store(clock: &Arc<ManualClock>) -> StreamStore {
    StreamStore::in_memory(StoreOptions {
        clock: clock.clone(),
        ..StoreOptions::default()
    })
    .expect("in-memory store")
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(1_700_000_000_000))
}

pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("payload must be an object, got {other}"),
    }
}

pub fn insert(event_id: &str, document_id: &str, subject: &str, seconds: u32) -> ChangeEvent {
    event(
        event_id,
        document_id,
        Change::Insert {
            payload: payload(json!({"subject": subject, "body": format!("about {subject}")})),
        },
        seconds,
    )
}

pub fn update(event_id: &str, document_id: &str, subject: &str, seconds: u32) -> ChangeEvent {
    event(
        event_id,
        document_id,
        Change::Update {
            payload: payload(json!({"subject": subject, "body": format!("about {subject}")})),
        },
        seconds,
    )
}

pub fn delete(event_id: &str, document_id: &str, seconds: u32) -> ChangeEvent {
    event(event_id, document_id, Change::Delete, seconds)
}

fn event(event_id: &str, document_id: &str, change: Change, seconds: u32) -> ChangeEvent {
    ChangeEvent {
        event_id: event_id.into(),
        change,
        document_id: document_id.into(),
        source_timestamp: SourceTimestamp::new(seconds, 0),
        resume_position: ResumePosition(format!("pos-{seconds}")),
    }
}

pub fn embedding_config() -> EmbeddingConsumerConfig {
    EmbeddingConsumerConfig {
        block_timeout: Duration::ZERO,
        max_wait: Duration::ZERO,
        ..EmbeddingConsumerConfig::default()
    }
}

pub fn upsert_config() -> UpsertConsumerConfig {
    UpsertConsumerConfig {
        block_timeout: Duration::ZERO,
        max_wait: Duration::ZERO,
        ..UpsertConsumerConfig::default()
    }
}

pub fn embedder<S: EmbeddingService>(
    store: &StreamStore,
    name: &str,
    service: S,
) -> EmbeddingConsumer<S> {
    EmbeddingConsumer::new(store, name, service, embedding_config(), Shutdown::new())
        .expect("join embedding group")
}

pub fn upserter<I: VectorIndex>(store: &StreamStore, name: &str, index: I) -> UpsertConsumer<I> {
    UpsertConsumer::new(store, name, index, upsert_config(), Shutdown::new())
        .expect("join upsert group")
}

/// Steps until a read comes back empty.
pub fn drain_embedder<S: EmbeddingService>(consumer: &mut EmbeddingConsumer<S>) {
    for _ in 0..100 {
        if consumer.step().expect("embedding step") == StepOutcome::Idle {
            return;
        }
    }
    panic!("embedding consumer never went idle");
}

/// Steps until a read comes back empty.
pub fn drain_upserter<I: VectorIndex>(consumer: &mut UpsertConsumer<I>) {
    for _ in 0..100 {
        if consumer.step().expect("upsert step") == StepOutcome::Idle {
            return;
        }
    }
    panic!("upsert consumer never went idle");
}

pub fn stage2_documents(store: &StreamStore) -> Vec<EmbeddedDocument> {
    store
        .stream(STAGE2)
        .range(StreamId::ZERO, 1_000)
        .expect("range")
        .iter()
        .map(|entry| entry.decode().expect("stage-2 record"))
        .collect()
}
