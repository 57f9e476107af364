//! Consumer-group workers for both pipeline hops.
//!
//! Each worker walks `IDLE → READ → ACCUMULATE → FLUSH → ACK_OR_RETRY → IDLE`.
//! Failed entries are never retried in-process: they stay in the group's PEL
//! and come back through [`GroupMember::reclaim_due`] once their backoff has
//! elapsed, until the [`RetryPolicy`] gives up and dead-letters them.

pub mod embedding;
pub mod pool;
pub mod upsert;

pub use embedding::{EmbeddingConsumer, EmbeddingConsumerConfig};
pub use pool::{run_pool, Worker};
pub use upsert::{UpsertConsumer, UpsertConsumerConfig};

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ErrorClass, PipelineError};
use crate::event::DeadLetter;
use crate::stream::{Delivery, DueRule, GroupStart, Stream, StreamError, StreamId};

/// Suffix of the dead-letter stream paired with every input stream.
pub const DEAD_LETTER_SUFFIX: &str = "_dead";

/// Dead-letter stream name for `stream`.
pub fn dead_letter_stream(stream: &str) -> String {
    format!("{stream}{DEAD_LETTER_SUFFIX}")
}

/// Consumer name unique to this process and worker slot.
pub fn consumer_name(prefix: &str, worker: usize) -> String {
    format!("{prefix}-{}-{worker}", std::process::id())
}

/// Redelivery backoff and dead-letter budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Idle time before the first redelivery.
    pub base_backoff: Duration,
    /// Upper bound of the doubling backoff.
    pub max_backoff: Duration,
    /// Deliveries after which a still-failing entry is dead-lettered.
    pub max_deliveries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            max_deliveries: 5,
        }
    }
}

impl RetryPolicy {
    /// Idle time an entry delivered `delivery_count` times must reach before
    /// the next attempt: `base * 2^(n-1)`, capped at `max_backoff`.
    pub fn backoff(&self, delivery_count: u32) -> Duration {
        let exponent = delivery_count.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Whether a failed attempt at this delivery count was the last one.
    pub fn exhausted(&self, delivery_count: u32) -> bool {
        delivery_count >= self.max_deliveries.max(1)
    }
}

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Between iterations.
    Idle,
    /// Blocked on the stream read.
    Read,
    /// Topping up a partial batch.
    Accumulate,
    /// Calling the downstream service.
    Flush,
    /// Appending results, acking, or leaving failures pending.
    AckOrRetry,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerState::Idle => "idle",
            WorkerState::Read => "read",
            WorkerState::Accumulate => "accumulate",
            WorkerState::Flush => "flush",
            WorkerState::AckOrRetry => "ack_or_retry",
        })
    }
}

/// Counters a worker keeps over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Non-empty batches flushed.
    pub batches: u64,
    /// Entries handled and acked.
    pub acked: u64,
    /// Records written downstream (stage-2 appends or index writes).
    pub written: u64,
    /// Entries acked without a write because something newer already won.
    pub skipped: u64,
    /// Entries left pending after a failed attempt.
    pub failed: u64,
    /// Entries routed to the dead-letter stream.
    pub dead_lettered: u64,
    /// Entries taken over through claim.
    pub claimed: u64,
}

impl WorkerStats {
    /// Adds another worker's counters to these.
    pub fn merge(&mut self, other: &WorkerStats) {
        self.batches += other.batches;
        self.acked += other.acked;
        self.written += other.written;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.claimed += other.claimed;
    }
}

/// What one worker iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do before the read timed out.
    Idle,
    /// A batch was processed.
    Processed {
        /// Entries in the batch.
        entries: usize,
    },
    /// Shutdown arrived mid-batch; nothing was acked.
    Interrupted,
}

/// A worker's seat in one consumer group, plus its dead-letter outlet.
#[derive(Debug, Clone)]
pub struct GroupMember {
    stream: Stream,
    group: String,
    consumer: String,
    dead_letters: Stream,
    retry: RetryPolicy,
    claim_idle: Duration,
}

impl GroupMember {
    /// Joins `group` on `stream`, creating the group at the stream's
    /// beginning if it does not exist yet.
    pub fn join(
        stream: Stream,
        group: impl Into<String>,
        consumer: impl Into<String>,
        retry: RetryPolicy,
        claim_idle: Duration,
    ) -> Result<Self, StreamError> {
        let group = group.into();
        if stream.ensure_group(&group, GroupStart::Beginning)? {
            debug!(stream = stream.name(), group = %group, "created consumer group");
        }
        let dead_letters = stream.store().stream(dead_letter_stream(stream.name()));
        Ok(Self {
            stream,
            group,
            consumer: consumer.into(),
            dead_letters,
            retry,
            claim_idle,
        })
    }

    /// Input stream.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Group name.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// This worker's consumer name.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Retry policy in force.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Blocking read of fresh entries.
    pub fn read(&self, max_count: usize, block: Duration) -> Result<Vec<Delivery>, StreamError> {
        self.stream.read(&self.group, &self.consumer, max_count, block)
    }

    /// Reads until `max_count` entries arrived or `max_wait` elapsed, blocking
    /// up to `block` for the first one.
    pub fn read_batch(
        &self,
        max_count: usize,
        block: Duration,
        max_wait: Duration,
        on_accumulate: impl FnOnce(),
    ) -> Result<Vec<Delivery>, StreamError> {
        let mut batch = self.read(max_count, block)?;
        if batch.is_empty() || batch.len() >= max_count {
            return Ok(batch);
        }
        on_accumulate();
        let deadline = Instant::now() + max_wait;
        while batch.len() < max_count {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            batch.extend(self.read(max_count - batch.len(), deadline - now)?);
        }
        Ok(batch)
    }

    /// Claims pending entries whose backoff has elapsed, oldest first.
    ///
    /// Entries owned by this consumer are due after their backoff; entries
    /// owned by anyone else additionally need `claim_idle`, so a live but slow
    /// worker keeps its in-flight entries.
    pub fn reclaim_due(&self, max_count: usize) -> Result<Vec<Delivery>, StreamError> {
        let rule = DueRule {
            base_backoff: self.retry.base_backoff,
            max_backoff: self.retry.max_backoff,
            claim_idle: self.claim_idle,
        };
        let claimed = self
            .stream
            .claim_due(&self.group, &self.consumer, &rule, max_count)?;
        for delivery in &claimed {
            debug!(
                stream = self.stream.name(),
                group = %self.group,
                consumer = %self.consumer,
                id = %delivery.id(),
                delivery_count = delivery.delivery_count,
                "reclaimed pending entry"
            );
        }
        Ok(claimed)
    }

    /// Acknowledges processed entries.
    pub fn ack(&self, ids: &[StreamId]) -> Result<usize, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.stream.ack(&self.group, ids)
    }

    /// Records `delivery` on the dead-letter stream, then acks it.
    pub fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<StreamId, StreamError> {
        let record = DeadLetter {
            source_stream: self.stream.name().to_string(),
            group: self.group.clone(),
            stream_id: Some(delivery.id()),
            delivery_count: delivery.delivery_count,
            reason: reason.to_string(),
            failed_at_ms: self.stream.store().now_ms(),
            body: delivery.entry.body.clone(),
        };
        let dead_id = self.dead_letters.append_json(&record)?;
        self.ack(&[delivery.id()])?;
        warn!(
            stream = self.stream.name(),
            group = %self.group,
            id = %delivery.id(),
            delivery_count = delivery.delivery_count,
            dead_letter_id = %dead_id,
            reason,
            "dead-lettered entry"
        );
        Ok(dead_id)
    }

    /// Handles a failed attempt at `delivery`, one of `batch_len` entries
    /// processed together. Returns whether the entry was dead-lettered.
    ///
    /// A poison failure is pinned on the entry only when it was processed
    /// alone; inside a larger batch every entry stays pending and is retried
    /// by itself after the backoff. Any other failure dead-letters the entry
    /// once its delivery budget is spent.
    pub fn fail(
        &self,
        delivery: &Delivery,
        err: &PipelineError,
        batch_len: usize,
    ) -> Result<bool, StreamError> {
        let reason = err.to_string();
        let poison = err.class() == ErrorClass::PoisonMessage && batch_len <= 1;
        if poison || self.retry.exhausted(delivery.delivery_count) {
            self.dead_letter(delivery, &reason)?;
            return Ok(true);
        }
        warn!(
            stream = self.stream.name(),
            group = %self.group,
            id = %delivery.id(),
            delivery_count = delivery.delivery_count,
            retry_in_ms = self.retry.backoff(delivery.delivery_count).as_millis() as u64,
            reason = %reason,
            "attempt failed, leaving entry pending"
        );
        Ok(false)
    }
}
