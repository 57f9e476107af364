//! Stage-1 worker: change events in, embeddings and tombstones out.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, trace};

use super::{GroupMember, RetryPolicy, StepOutcome, WorkerState, WorkerStats};
use crate::embedder::EmbeddingService;
use crate::error::PipelineError;
use crate::event::{Change, ChangeEvent, EmbeddedDocument, Payload};
use crate::shutdown::Shutdown;
use crate::stream::{Delivery, Stream, StreamError, StreamId, StreamStore};

/// Characters of `body` kept as `content_preview` metadata.
pub const CONTENT_PREVIEW_CHARS: usize = 500;

/// Settings of an [`EmbeddingConsumer`].
#[derive(Debug, Clone)]
pub struct EmbeddingConsumerConfig {
    /// Stage-1 stream.
    pub input_stream: String,
    /// Consumer group on stage-1.
    pub group: String,
    /// Stage-2 stream.
    pub output_stream: String,
    /// Entries per embedding call.
    pub batch_size: usize,
    /// How long a partial batch may wait for more entries.
    pub max_wait: Duration,
    /// How long an empty read blocks.
    pub block_timeout: Duration,
    /// Redelivery backoff and dead-letter budget.
    pub retry: RetryPolicy,
    /// Idle time before another consumer's pending entry may be taken over.
    pub claim_idle: Duration,
    /// Payload fields joined into the embedded text.
    pub text_fields: Vec<String>,
    /// Payload fields copied into metadata; `None` keeps the whole payload.
    pub metadata_fields: Option<Vec<String>>,
    /// Expected vector width.
    pub dimensions: Option<usize>,
}

impl Default for EmbeddingConsumerConfig {
    fn default() -> Self {
        Self {
            input_stream: "raw_document_changes".into(),
            group: "embedding_processors".into(),
            output_stream: "embedded_documents".into(),
            batch_size: 5,
            max_wait: Duration::from_millis(500),
            block_timeout: Duration::from_millis(5000),
            retry: RetryPolicy::default(),
            claim_idle: Duration::from_secs(60),
            text_fields: vec!["subject".into(), "body".into()],
            metadata_fields: None,
            dimensions: None,
        }
    }
}

impl EmbeddingConsumerConfig {
    /// Text to embed for `payload`, or `None` when no configured field has any.
    pub fn text_for(&self, payload: &Payload) -> Option<String> {
        let parts: Vec<String> = self
            .text_fields
            .iter()
            .filter_map(|field| payload.get(field))
            .filter_map(|value| match value {
                Value::Null => None,
                Value::String(text) => Some(text.trim().to_string()),
                other => Some(other.to_string()),
            })
            .filter(|text| !text.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }

    /// Metadata stored next to the vector.
    pub fn metadata_for(&self, payload: &Payload) -> Payload {
        let mut metadata = match &self.metadata_fields {
            None => payload.clone(),
            Some(fields) => fields
                .iter()
                .filter_map(|field| payload.get(field).map(|value| (field.clone(), value.clone())))
                .collect(),
        };
        if let Some(Value::String(body)) = payload.get("body") {
            let preview: String = body.chars().take(CONTENT_PREVIEW_CHARS).collect();
            metadata.insert("content_preview".into(), Value::String(preview));
        }
        metadata
    }
}

/// One embedding-stage worker.
pub struct EmbeddingConsumer<S> {
    member: GroupMember,
    output: Stream,
    service: S,
    config: EmbeddingConsumerConfig,
    shutdown: Shutdown,
    state: WorkerState,
    stats: WorkerStats,
}

struct Pending<'a> {
    delivery: &'a Delivery,
    event: ChangeEvent,
    text: String,
}

impl<S: EmbeddingService> EmbeddingConsumer<S> {
    /// Joins the stage-1 group as `consumer`.
    pub fn new(
        store: &StreamStore,
        consumer: impl Into<String>,
        service: S,
        config: EmbeddingConsumerConfig,
        shutdown: Shutdown,
    ) -> Result<Self, StreamError> {
        let member = GroupMember::join(
            store.stream(config.input_stream.as_str()),
            config.group.as_str(),
            consumer,
            config.retry,
            config.claim_idle,
        )?;
        let output = store.stream(config.output_stream.as_str());
        Ok(Self {
            member,
            output,
            service,
            config,
            shutdown,
            state: WorkerState::Idle,
            stats: WorkerStats::default(),
        })
    }

    /// Current loop state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Lifetime counters.
    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Consumer name.
    pub fn consumer(&self) -> &str {
        self.member.consumer()
    }

    /// Loops until shutdown. Only fatal errors end the loop early.
    pub fn run(&mut self) -> Result<WorkerStats, PipelineError> {
        info!(
            stream = self.member.stream().name(),
            group = self.member.group(),
            consumer = self.member.consumer(),
            "embedding consumer started"
        );
        while !self.shutdown.is_triggered() {
            match self.step() {
                Ok(_) => {}
                Err(StreamError::Closed) if self.shutdown.is_triggered() => break,
                Err(err) => return Err(err.into()),
            }
        }
        info!(consumer = self.member.consumer(), stats = ?self.stats, "embedding consumer stopped");
        Ok(self.stats)
    }

    /// One pass: retry due entries if any, otherwise read and flush a fresh batch.
    pub fn step(&mut self) -> Result<StepOutcome, StreamError> {
        self.transition(WorkerState::Idle);
        let reclaimed = self.member.reclaim_due(self.config.batch_size)?;
        if !reclaimed.is_empty() {
            self.stats.claimed += reclaimed.len() as u64;
            let entries = reclaimed.len();
            // Retries go one at a time so a poison entry fails alone.
            for delivery in &reclaimed {
                if self.flush(std::slice::from_ref(delivery))? == StepOutcome::Interrupted {
                    return Ok(StepOutcome::Interrupted);
                }
            }
            return Ok(StepOutcome::Processed { entries });
        }

        self.transition(WorkerState::Read);
        let mut accumulating = false;
        let batch = self.member.read_batch(
            self.config.batch_size.max(1),
            self.config.block_timeout,
            self.config.max_wait,
            || accumulating = true,
        )?;
        if accumulating {
            self.transition(WorkerState::Accumulate);
        }
        if batch.is_empty() {
            return Ok(StepOutcome::Idle);
        }
        self.flush(&batch)
    }

    fn flush(&mut self, batch: &[Delivery]) -> Result<StepOutcome, StreamError> {
        self.transition(WorkerState::Flush);
        self.stats.batches += 1;
        let mut ready: Vec<(StreamId, EmbeddedDocument)> = Vec::with_capacity(batch.len());
        let mut to_embed: Vec<Pending<'_>> = Vec::new();

        for delivery in batch {
            let event: ChangeEvent = match delivery.entry.decode() {
                Ok(event) => event,
                Err(err) => {
                    self.poison(delivery, format!("undecodable change event: {err}"))?;
                    continue;
                }
            };
            if event.change == Change::Delete {
                ready.push((delivery.id(), EmbeddedDocument::tombstone(&event)));
                continue;
            }
            match event.change.payload().and_then(|p| self.config.text_for(p)) {
                Some(text) => to_embed.push(Pending {
                    delivery,
                    event,
                    text,
                }),
                None => {
                    let reason = format!(
                        "document {} has no text in fields {:?}",
                        event.document_id, self.config.text_fields
                    );
                    self.poison(delivery, reason)?;
                }
            }
        }

        let mut failure: Option<PipelineError> = None;
        if !to_embed.is_empty() {
            let texts: Vec<&str> = to_embed.iter().map(|item| item.text.as_str()).collect();
            let result = self
                .service
                .embed_batch(&texts)
                .and_then(|vectors| {
                    crate::embedder::validate_batch(&vectors, texts.len(), self.config.dimensions)
                        .map(|()| vectors)
                });
            match result {
                Ok(vectors) => {
                    for (item, vector) in to_embed.iter().zip(vectors) {
                        let metadata = item
                            .event
                            .change
                            .payload()
                            .map(|payload| self.config.metadata_for(payload))
                            .unwrap_or_default();
                        ready.push((
                            item.delivery.id(),
                            EmbeddedDocument::embedded(&item.event, vector, metadata),
                        ));
                    }
                }
                Err(err) => failure = Some(PipelineError::Embedding(err)),
            }
        }

        if self.shutdown.is_triggered() {
            debug!(
                consumer = self.member.consumer(),
                entries = batch.len(),
                "shutdown requested, leaving batch pending"
            );
            return Ok(StepOutcome::Interrupted);
        }

        self.transition(WorkerState::AckOrRetry);
        ready.sort_by_key(|(id, _)| *id);
        let mut done = Vec::with_capacity(ready.len());
        for (id, document) in &ready {
            self.output.append_json(document)?;
            done.push(*id);
        }
        // Stage-2 appends above happen before the stage-1 ack.
        self.member.ack(&done)?;
        self.stats.written += done.len() as u64;
        self.stats.acked += done.len() as u64;

        if let Some(err) = failure {
            for item in &to_embed {
                if self.member.fail(item.delivery, &err, to_embed.len())? {
                    self.stats.dead_lettered += 1;
                } else {
                    self.stats.failed += 1;
                }
            }
        }
        Ok(StepOutcome::Processed {
            entries: batch.len(),
        })
    }

    fn poison(&mut self, delivery: &Delivery, reason: String) -> Result<(), StreamError> {
        self.member.fail(delivery, &PipelineError::Poison(reason), 1)?;
        self.stats.dead_lettered += 1;
        Ok(())
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            trace!(consumer = self.member.consumer(), from = %self.state, to = %next, "state");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::embedder::ServiceError;
    use crate::event::{DeadLetter, ResumePosition, SourceTimestamp};
    use crate::stream::{StoreOptions, StreamEntry};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Default)]
    struct ScriptedService {
        fail: Mutex<bool>,
        reject_containing: Mutex<Option<String>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl EmbeddingService for ScriptedService {
        fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ServiceError> {
            self.calls
                .lock()
                .push(inputs.iter().map(|s| s.to_string()).collect());
            if *self.fail.lock() {
                return Err(ServiceError::Unavailable("503".into()));
            }
            if let Some(marker) = self.reject_containing.lock().as_deref() {
                if inputs.iter().any(|input| input.contains(marker)) {
                    return Err(ServiceError::Rejected {
                        status: 413,
                        body: "input too large".into(),
                    });
                }
            }
            Ok(inputs.iter().map(|s| vec![s.len() as f32, 1.0]).collect())
        }
    }

    fn change(id: &str, doc: &str, change: Change, secs: u32) -> ChangeEvent {
        ChangeEvent {
            event_id: id.into(),
            change,
            document_id: doc.into(),
            source_timestamp: SourceTimestamp::new(secs, 0),
            resume_position: ResumePosition(secs.to_string()),
        }
    }

    fn insert(id: &str, doc: &str, subject: &str, secs: u32) -> ChangeEvent {
        let payload = json!({"subject": subject, "body": "body text", "sender": "x@y"});
        let Value::Object(payload) = payload else {
            unreachable!()
        };
        change(id, doc, Change::Insert { payload }, secs)
    }

    fn setup(
        config: EmbeddingConsumerConfig,
    ) -> (
        StreamStore,
        Arc<ManualClock>,
        Arc<ScriptedService>,
        EmbeddingConsumer<Arc<ScriptedService>>,
    ) {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = StreamStore::in_memory(StoreOptions {
            clock: clock.clone(),
            ..StoreOptions::default()
        })
        .unwrap();
        let service = Arc::new(ScriptedService::default());
        let consumer =
            EmbeddingConsumer::new(&store, "w-1", service.clone(), config, Shutdown::new())
                .unwrap();
        (store, clock, service, consumer)
    }

    fn quick() -> EmbeddingConsumerConfig {
        EmbeddingConsumerConfig {
            block_timeout: Duration::ZERO,
            max_wait: Duration::ZERO,
            ..EmbeddingConsumerConfig::default()
        }
    }

    fn stage2(store: &StreamStore) -> Vec<EmbeddedDocument> {
        store
            .stream("embedded_documents")
            .range(StreamId::ZERO, 100)
            .unwrap()
            .iter()
            .map(|entry: &StreamEntry| entry.decode().unwrap())
            .collect()
    }

    #[test]
    fn batches_inserts_and_passes_deletes_through_as_tombstones() {
        let (store, _, service, mut consumer) = setup(quick());
        let input = store.stream("raw_document_changes");
        input.append_json(&insert("e1", "A", "hello", 1)).unwrap();
        input
            .append_json(&change("e2", "B", Change::Delete, 2))
            .unwrap();
        input.append_json(&insert("e3", "C", "world", 3)).unwrap();

        assert_eq!(
            consumer.step().unwrap(),
            StepOutcome::Processed { entries: 3 }
        );
        assert_eq!(service.calls.lock().len(), 1, "one call for the whole batch");
        assert_eq!(service.calls.lock()[0], vec!["hello body text", "world body text"]);

        let docs = stage2(&store);
        let ids: Vec<&str> = docs.iter().map(|d| d.document_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert!(docs[1].tombstone && docs[1].vector.is_none());
        assert_eq!(docs[0].metadata["content_preview"], "body text");
        assert_eq!(docs[2].source_event_id, "e3");
        assert!(input.pending("embedding_processors").unwrap().is_empty());
    }

    #[test]
    fn service_failure_acks_tombstones_and_keeps_the_rest_pending() {
        let (store, clock, service, mut consumer) = setup(quick());
        let input = store.stream("raw_document_changes");
        input.append_json(&insert("e1", "A", "hello", 1)).unwrap();
        input
            .append_json(&change("e2", "A", Change::Delete, 2))
            .unwrap();
        *service.fail.lock() = true;

        consumer.step().unwrap();
        let pending = input.pending("embedding_processors").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(stage2(&store).len(), 1, "tombstone still flows");
        assert_eq!(consumer.stats().failed, 1);

        *service.fail.lock() = false;
        assert_eq!(consumer.step().unwrap(), StepOutcome::Idle, "backoff not elapsed");
        clock.advance(Duration::from_secs(1));
        consumer.step().unwrap();
        assert!(input.pending("embedding_processors").unwrap().is_empty());
        assert_eq!(stage2(&store).len(), 2);
        assert_eq!(consumer.stats().claimed, 1);
    }

    #[test]
    fn documents_without_text_are_dead_lettered_at_once() {
        let (store, _, service, mut consumer) = setup(quick());
        let input = store.stream("raw_document_changes");
        let Value::Object(payload) = json!({"subject": "  ", "sender": "x"}) else {
            unreachable!()
        };
        input
            .append_json(&change("e1", "A", Change::Update { payload }, 1))
            .unwrap();
        input.append("not json").unwrap();

        consumer.step().unwrap();
        assert!(service.calls.lock().is_empty());
        assert!(input.pending("embedding_processors").unwrap().is_empty());
        let dead = store
            .stream("raw_document_changes_dead")
            .range(StreamId::ZERO, 10)
            .unwrap();
        assert_eq!(dead.len(), 2);
        let first: DeadLetter = dead[0].decode().unwrap();
        assert_eq!(first.delivery_count, 1);
        assert_eq!(consumer.stats().dead_lettered, 2);
    }

    #[test]
    fn wrong_dimensions_fail_the_batch() {
        let config = EmbeddingConsumerConfig {
            dimensions: Some(3),
            ..quick()
        };
        let (store, _, _, mut consumer) = setup(config);
        let input = store.stream("raw_document_changes");
        input.append_json(&insert("e1", "A", "hello", 1)).unwrap();
        consumer.step().unwrap();
        assert_eq!(input.pending("embedding_processors").unwrap().len(), 1);
        assert!(stage2(&store).is_empty());
    }

    #[test]
    fn shutdown_mid_batch_skips_append_and_ack() {
        let (store, _, _, mut consumer) = setup(quick());
        let input = store.stream("raw_document_changes");
        input.append_json(&insert("e1", "A", "hello", 1)).unwrap();
        consumer.shutdown.trigger();
        assert_eq!(consumer.step().unwrap(), StepOutcome::Interrupted);
        assert!(stage2(&store).is_empty());
        assert_eq!(input.pending("embedding_processors").unwrap().len(), 1);
    }

    #[test]
    fn metadata_selection_and_preview_truncation() {
        let config = EmbeddingConsumerConfig {
            metadata_fields: Some(vec!["sender".into()]),
            ..EmbeddingConsumerConfig::default()
        };
        let long = "x".repeat(800);
        let Value::Object(payload) = json!({"sender": "a@b", "body": long, "secret": 1}) else {
            unreachable!()
        };
        let metadata = config.metadata_for(&payload);
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["sender"], "a@b");
        assert_eq!(
            metadata["content_preview"].as_str().unwrap().chars().count(),
            CONTENT_PREVIEW_CHARS
        );
        assert_eq!(config.text_for(&payload).as_deref(), Some(long.as_str()));
    }

    #[test]
    fn rejected_input_is_isolated_by_single_retries() {
        let (store, clock, service, mut consumer) = setup(quick());
        let input = store.stream("raw_document_changes");
        input.append_json(&insert("e1", "A", "fine", 1)).unwrap();
        input.append_json(&insert("e2", "B", "huge", 2)).unwrap();
        *service.reject_containing.lock() = Some("huge".into());

        consumer.step().unwrap();
        assert_eq!(consumer.stats().failed, 2, "the batch hides which input was refused");
        assert_eq!(consumer.stats().dead_lettered, 0);
        assert_eq!(input.pending("embedding_processors").unwrap().len(), 2);

        clock.advance(Duration::from_secs(1));
        consumer.step().unwrap();
        assert_eq!(service.calls.lock().len(), 3, "one batched call, then one per retry");
        let docs = stage2(&store);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].document_id, "A");
        let dead = store
            .stream("raw_document_changes_dead")
            .range(StreamId::ZERO, 10)
            .unwrap();
        assert_eq!(dead.len(), 1);
        let record: DeadLetter = dead[0].decode().unwrap();
        assert_eq!(record.delivery_count, 2);
        assert!(record.reason.contains("413"));
        assert!(input.pending("embedding_processors").unwrap().is_empty());
    }
}
