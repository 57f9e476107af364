//! Stage-2 worker: embedded documents in, index writes out.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, error, info, trace};

use super::{GroupMember, RetryPolicy, StepOutcome, WorkerState, WorkerStats};
use crate::error::PipelineError;
use crate::event::{EmbeddedDocument, EmbeddingVersion, IndexAction};
use crate::index::{IndexDeletion, IndexError, IndexRecord, VectorIndex};
use crate::shutdown::Shutdown;
use crate::stream::{Delivery, StreamError, StreamId, StreamStore};

/// Settings of an [`UpsertConsumer`].
#[derive(Debug, Clone)]
pub struct UpsertConsumerConfig {
    /// Stage-2 stream.
    pub input_stream: String,
    /// Consumer group on stage-2.
    pub group: String,
    /// Entries per index round trip.
    pub batch_size: usize,
    /// How long a partial batch may wait for more entries.
    pub max_wait: Duration,
    /// How long an empty read blocks.
    pub block_timeout: Duration,
    /// Redelivery backoff and dead-letter budget.
    pub retry: RetryPolicy,
    /// Idle time before another consumer's pending entry may be taken over.
    pub claim_idle: Duration,
    /// Vector width the index expects.
    pub dimensions: Option<usize>,
}

impl Default for UpsertConsumerConfig {
    fn default() -> Self {
        Self {
            input_stream: "embedded_documents".into(),
            group: "qdrant_upserters".into(),
            batch_size: 10,
            max_wait: Duration::from_millis(500),
            block_timeout: Duration::from_millis(5000),
            retry: RetryPolicy::default(),
            claim_idle: Duration::from_secs(60),
            dimensions: None,
        }
    }
}

/// One indexing-stage worker.
pub struct UpsertConsumer<I> {
    member: GroupMember,
    index: I,
    config: UpsertConsumerConfig,
    shutdown: Shutdown,
    state: WorkerState,
    stats: WorkerStats,
}

struct Decoded<'a> {
    delivery: &'a Delivery,
    write: Write,
}

/// Index write a well-formed stage-2 record turns into.
enum Write {
    Upsert(IndexRecord),
    Delete(IndexDeletion),
}

impl Write {
    fn document_id(&self) -> &str {
        match self {
            Write::Upsert(record) => &record.document_id,
            Write::Delete(deletion) => &deletion.document_id,
        }
    }

    fn version(&self) -> EmbeddingVersion {
        match self {
            Write::Upsert(record) => record.version,
            Write::Delete(deletion) => deletion.version,
        }
    }
}

impl<I: VectorIndex> UpsertConsumer<I> {
    /// Joins the stage-2 group as `consumer`.
    pub fn new(
        store: &StreamStore,
        consumer: impl Into<String>,
        index: I,
        config: UpsertConsumerConfig,
        shutdown: Shutdown,
    ) -> Result<Self, StreamError> {
        let member = GroupMember::join(
            store.stream(config.input_stream.as_str()),
            config.group.as_str(),
            consumer,
            config.retry,
            config.claim_idle,
        )?;
        Ok(Self {
            member,
            index,
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

    /// Index this worker writes to.
    pub fn index(&self) -> &I {
        &self.index
    }

    /// Loops until shutdown. Only fatal errors end the loop early.
    pub fn run(&mut self) -> Result<WorkerStats, PipelineError> {
        info!(
            stream = self.member.stream().name(),
            group = self.member.group(),
            consumer = self.member.consumer(),
            "upsert consumer started"
        );
        while !self.shutdown.is_triggered() {
            match self.step() {
                Ok(_) => {}
                Err(PipelineError::Stream(StreamError::Closed)) if self.shutdown.is_triggered() => {
                    break
                }
                Err(err) => return Err(err),
            }
        }
        info!(consumer = self.member.consumer(), stats = ?self.stats, "upsert consumer stopped");
        Ok(self.stats)
    }

    /// One pass: retry due entries if any, otherwise read and flush a fresh batch.
    pub fn step(&mut self) -> Result<StepOutcome, PipelineError> {
        self.transition(WorkerState::Idle);
        let reclaimed = self.member.reclaim_due(self.config.batch_size)?;
        if !reclaimed.is_empty() {
            self.stats.claimed += reclaimed.len() as u64;
            for delivery in &reclaimed {
                if self.flush(std::slice::from_ref(delivery))? == StepOutcome::Interrupted {
                    return Ok(StepOutcome::Interrupted);
                }
            }
            return Ok(StepOutcome::Processed {
                entries: reclaimed.len(),
            });
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

    fn flush(&mut self, batch: &[Delivery]) -> Result<StepOutcome, PipelineError> {
        self.transition(WorkerState::Flush);
        self.stats.batches += 1;

        let mut decoded: Vec<Decoded<'_>> = Vec::with_capacity(batch.len());
        for delivery in batch {
            let document: EmbeddedDocument = match delivery.entry.decode() {
                Ok(document) => document,
                Err(err) => {
                    self.poison(delivery, format!("undecodable embedded document: {err}"))?;
                    continue;
                }
            };
            match self.to_write(document) {
                Ok(write) => decoded.push(Decoded { delivery, write }),
                Err(reason) => self.poison(delivery, reason)?,
            }
        }

        // Only the newest record per document in this batch matters.
        let mut newest: HashMap<&str, usize> = HashMap::new();
        for (pos, item) in decoded.iter().enumerate() {
            let slot = newest.entry(item.write.document_id()).or_insert(pos);
            if decoded[*slot].write.version() < item.write.version() {
                *slot = pos;
            }
        }
        let mut winners: Vec<usize> = newest.into_values().collect();
        winners.sort_unstable();
        let superseded = decoded.len() - winners.len();

        let outcome = self.apply(&decoded, &winners);

        if self.shutdown.is_triggered() {
            debug!(
                consumer = self.member.consumer(),
                entries = batch.len(),
                "shutdown requested, leaving batch pending"
            );
            return Ok(StepOutcome::Interrupted);
        }

        self.transition(WorkerState::AckOrRetry);
        match outcome {
            Ok(written) => {
                let ids: Vec<StreamId> = decoded.iter().map(|item| item.delivery.id()).collect();
                self.member.ack(&ids)?;
                self.stats.acked += ids.len() as u64;
                self.stats.written += written as u64;
                self.stats.skipped += (winners.len() - written + superseded) as u64;
            }
            Err(err) => {
                let err = PipelineError::Index(err);
                if err.is_fatal() {
                    error!(
                        consumer = self.member.consumer(),
                        entries = decoded.len(),
                        error = %err,
                        "index unusable, leaving batch pending"
                    );
                    return Err(err);
                }
                for item in &decoded {
                    if self.member.fail(item.delivery, &err, decoded.len())? {
                        self.stats.dead_lettered += 1;
                    } else {
                        self.stats.failed += 1;
                    }
                }
            }
        }
        Ok(StepOutcome::Processed {
            entries: batch.len(),
        })
    }

    /// Writes the winning records, each only if it beats the version the
    /// index already holds. Returns how many were written.
    fn apply(&self, decoded: &[Decoded<'_>], winners: &[usize]) -> Result<usize, IndexError> {
        let mut upserts = Vec::new();
        let mut deletions = Vec::new();
        for &pos in winners {
            match &decoded[pos].write {
                Write::Upsert(record) => upserts.push(record.clone()),
                Write::Delete(deletion) => deletions.push(deletion.clone()),
            }
        }
        let written = self.index.upsert_if_newer(&upserts)? + self.index.delete_if_newer(&deletions)?;
        if written < winners.len() {
            trace!(
                consumer = self.member.consumer(),
                skipped = winners.len() - written,
                "index already held newer or equal versions"
            );
        }
        Ok(written)
    }

    fn to_write(&self, document: EmbeddedDocument) -> Result<Write, String> {
        let vector = match document.action() {
            Err(err) => return Err(err.to_string()),
            Ok(IndexAction::Delete) => None,
            Ok(IndexAction::Upsert { vector }) => Some(vector.to_vec()),
        };
        let Some(vector) = vector else {
            return Ok(Write::Delete(IndexDeletion {
                document_id: document.document_id,
                version: document.embedding_version,
            }));
        };
        if let Some(dims) = self.config.dimensions.filter(|dims| *dims != vector.len()) {
            return Err(format!(
                "document {} has a {}-dimensional vector, index expects {dims}",
                document.document_id,
                vector.len()
            ));
        }
        Ok(Write::Upsert(IndexRecord {
            document_id: document.document_id,
            vector,
            metadata: document.metadata,
            version: document.embedding_version,
            source_event_id: document.source_event_id,
        }))
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
    use crate::event::{EmbeddingVersion, Payload};
    use crate::index::MemoryIndex;
    use crate::stream::StoreOptions;
    use std::sync::Arc;

    fn doc(id: &str, version: u64, vector: Option<Vec<f32>>) -> EmbeddedDocument {
        EmbeddedDocument {
            document_id: id.into(),
            tombstone: vector.is_none(),
            vector,
            metadata: Payload::new(),
            source_event_id: format!("evt-{version}"),
            embedding_version: EmbeddingVersion(version),
        }
    }

    fn setup(
        config: UpsertConsumerConfig,
    ) -> (StreamStore, Arc<MemoryIndex>, UpsertConsumer<Arc<MemoryIndex>>) {
        let store = StreamStore::in_memory(StoreOptions {
            clock: Arc::new(ManualClock::new(1_000)),
            ..StoreOptions::default()
        })
        .unwrap();
        let index = Arc::new(MemoryIndex::new());
        let consumer =
            UpsertConsumer::new(&store, "u-1", index.clone(), config, Shutdown::new()).unwrap();
        (store, index, consumer)
    }

    fn quick() -> UpsertConsumerConfig {
        UpsertConsumerConfig {
            block_timeout: Duration::ZERO,
            max_wait: Duration::ZERO,
            ..UpsertConsumerConfig::default()
        }
    }

    #[test]
    fn stale_embeddings_never_overwrite_newer_ones() {
        let (store, index, mut consumer) = setup(quick());
        let input = store.stream("embedded_documents");
        input.append_json(&doc("A", 20, Some(vec![2.0, 0.0]))).unwrap();
        consumer.step().unwrap();
        input.append_json(&doc("A", 10, Some(vec![1.0, 0.0]))).unwrap();
        consumer.step().unwrap();

        let stored = index.get("A").expect("A indexed");
        assert_eq!(stored.version, EmbeddingVersion(20));
        assert_eq!(stored.vector, vec![2.0, 0.0]);
        assert_eq!(consumer.stats().skipped, 1);
        assert!(input.pending("qdrant_upserters").unwrap().is_empty());
    }

    #[test]
    fn batch_keeps_only_the_newest_record_per_document() {
        let (store, index, mut consumer) = setup(quick());
        let input = store.stream("embedded_documents");
        input.append_json(&doc("A", 1, Some(vec![1.0]))).unwrap();
        input.append_json(&doc("A", 3, None)).unwrap();
        input.append_json(&doc("A", 2, Some(vec![2.0]))).unwrap();
        input.append_json(&doc("B", 1, Some(vec![5.0]))).unwrap();
        consumer.step().unwrap();

        assert!(index.get("A").is_none());
        assert_eq!(
            index.applied_version("A").unwrap(),
            Some(EmbeddingVersion(3))
        );
        assert!(index.get("B").is_some());
        assert_eq!(consumer.stats().written, 2);
        assert_eq!(consumer.stats().skipped, 2);
    }

    #[test]
    fn malformed_and_mismatched_records_are_dead_lettered() {
        let config = UpsertConsumerConfig {
            dimensions: Some(2),
            ..quick()
        };
        let (store, index, mut consumer) = setup(config);
        let input = store.stream("embedded_documents");
        input.append_json(&doc("A", 1, Some(vec![1.0, 2.0, 3.0]))).unwrap();
        let mut broken = doc("B", 1, Some(vec![1.0, 2.0]));
        broken.tombstone = true;
        input.append_json(&broken).unwrap();
        input.append("{").unwrap();
        input.append_json(&doc("C", 1, Some(vec![1.0, 2.0]))).unwrap();
        consumer.step().unwrap();

        assert_eq!(index.document_ids(), vec!["C".to_string()]);
        assert_eq!(consumer.stats().dead_lettered, 3);
        assert_eq!(
            store.stream("embedded_documents_dead").len().unwrap(),
            3
        );
        assert!(input.pending("qdrant_upserters").unwrap().is_empty());
    }

    #[test]
    fn applying_twice_is_a_no_op() {
        let (store, index, mut consumer) = setup(quick());
        let input = store.stream("embedded_documents");
        let record = doc("A", 7, Some(vec![0.5, 0.5]));
        input.append_json(&record).unwrap();
        input.append_json(&record).unwrap();
        consumer.step().unwrap();
        let once = index.get("A").unwrap();
        input.append_json(&record).unwrap();
        consumer.step().unwrap();
        assert_eq!(index.get("A").unwrap(), once);
        assert_eq!(index.len(), 1);
    }

    /// Index whose writes always fail the same way.
    struct BrokenIndex {
        missing: bool,
    }

    impl BrokenIndex {
        fn error(&self) -> IndexError {
            if self.missing {
                IndexError::MissingCollection("documents".into())
            } else {
                IndexError::Rejected {
                    status: 400,
                    body: "bad point".into(),
                }
            }
        }
    }

    impl VectorIndex for BrokenIndex {
        fn applied_version(&self, _: &str) -> Result<Option<EmbeddingVersion>, IndexError> {
            Ok(None)
        }
        fn upsert(&self, _: &[IndexRecord]) -> Result<(), IndexError> {
            Err(self.error())
        }
        fn delete(&self, _: &[IndexDeletion]) -> Result<(), IndexError> {
            Err(self.error())
        }
        fn upsert_if_newer(&self, _: &[IndexRecord]) -> Result<usize, IndexError> {
            Err(self.error())
        }
        fn delete_if_newer(&self, _: &[IndexDeletion]) -> Result<usize, IndexError> {
            Err(self.error())
        }
        fn search(&self, _: &[f32], _: usize) -> Result<Vec<crate::index::SearchMatch>, IndexError> {
            Ok(Vec::new())
        }
    }

    fn broken(missing: bool) -> (StreamStore, Arc<ManualClock>, UpsertConsumer<BrokenIndex>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = StreamStore::in_memory(StoreOptions {
            clock: clock.clone(),
            ..StoreOptions::default()
        })
        .unwrap();
        let consumer =
            UpsertConsumer::new(&store, "u-1", BrokenIndex { missing }, quick(), Shutdown::new())
                .unwrap();
        (store, clock, consumer)
    }

    #[test]
    fn missing_collection_halts_and_leaves_the_batch_pending() {
        let (store, _, mut consumer) = broken(true);
        let input = store.stream("embedded_documents");
        input.append_json(&doc("A", 1, Some(vec![1.0]))).unwrap();
        input.append_json(&doc("B", 1, None)).unwrap();

        let err = consumer.step().expect_err("collection missing");
        assert!(matches!(err, PipelineError::Index(IndexError::MissingCollection(_))));
        assert!(err.is_fatal());
        assert_eq!(input.pending("qdrant_upserters").unwrap().len(), 2);
        assert!(store.stream("embedded_documents_dead").is_empty().unwrap());
        assert_eq!(consumer.stats().dead_lettered, 0);
    }

    #[test]
    fn rejected_writes_are_retried_alone_then_dead_lettered() {
        let (store, clock, mut consumer) = broken(false);
        let input = store.stream("embedded_documents");
        input.append_json(&doc("A", 1, Some(vec![1.0]))).unwrap();
        input.append_json(&doc("B", 1, Some(vec![2.0]))).unwrap();

        consumer.step().unwrap();
        assert_eq!(consumer.stats().failed, 2, "either record could be the bad one");
        assert_eq!(input.pending("qdrant_upserters").unwrap().len(), 2);

        clock.advance(Duration::from_secs(1));
        consumer.step().unwrap();
        assert_eq!(consumer.stats().dead_lettered, 2);
        assert!(input.pending("qdrant_upserters").unwrap().is_empty());
        let dead = store
            .stream("embedded_documents_dead")
            .range(StreamId::ZERO, 10)
            .unwrap();
        let first: crate::event::DeadLetter = dead[0].decode().unwrap();
        assert_eq!(first.delivery_count, 2);
    }
}
