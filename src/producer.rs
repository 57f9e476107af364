//! Change producer: source change feed → stage-1 stream.
//!
//! Every change is appended before the checkpoint moves past it, so a crash in
//! between replays the change (a duplicate event) instead of losing it.
//! Changes the feed cannot read go to the stage-1 dead-letter stream under the
//! [`PRODUCER_GROUP`] name, with the checkpoint moving past them the same way.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::consumer::dead_letter_stream;
use crate::error::{ErrorClass, PipelineError};
use crate::event::{DeadLetter, ResumePosition};
use crate::shutdown::Shutdown;
use crate::source::{ChangeFeed, FeedError, FeedStart, SourceChange};
use crate::stream::{Stream, StreamError};

/// Group name recorded on dead letters the producer writes.
pub const PRODUCER_GROUP: &str = "producer";

/// Settings of a [`ChangeProducer`].
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Where to start when no checkpoint exists.
    pub initial_start: FeedStart,
    /// Ignore the checkpoint and start from `initial_start`.
    pub resync: bool,
    /// How long one feed poll waits for a change.
    pub poll_timeout: Duration,
    /// First reconnect delay.
    pub base_backoff: Duration,
    /// Upper bound of the reconnect delay.
    pub max_backoff: Duration,
    /// Consecutive feed failures tolerated before giving up.
    pub max_reconnects: u32,
    /// Length the stage-1 stream is trimmed to, if any.
    pub trim_max_len: Option<u64>,
    /// Appends between two trims.
    pub trim_every: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            initial_start: FeedStart::Now,
            resync: false,
            poll_timeout: Duration::from_secs(1),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_reconnects: 10,
            trim_max_len: None,
            trim_every: 10_000,
        }
    }
}

impl ProducerConfig {
    /// Reconnect delay after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Counters of a producer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Change events appended to stage-1.
    pub appended: u64,
    /// Feed reopen attempts after a failure.
    pub reconnects: u64,
    /// Stage-1 entries removed by trimming.
    pub trimmed: u64,
    /// Unreadable changes sent to the dead-letter stream.
    pub rejected: u64,
}

/// Tails a change feed into the stage-1 stream.
pub struct ChangeProducer<F, C> {
    feed: F,
    checkpoint: C,
    stream: Stream,
    dead_letters: Stream,
    config: ProducerConfig,
    shutdown: Shutdown,
    stats: ProducerStats,
}

impl<F: ChangeFeed, C: CheckpointStore> ChangeProducer<F, C> {
    /// Builds a producer appending to `stream`.
    pub fn new(
        feed: F,
        checkpoint: C,
        stream: Stream,
        config: ProducerConfig,
        shutdown: Shutdown,
    ) -> Self {
        let dead_letters = stream.store().stream(dead_letter_stream(stream.name()));
        Self {
            feed,
            checkpoint,
            stream,
            dead_letters,
            config,
            shutdown,
            stats: ProducerStats::default(),
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> ProducerStats {
        self.stats
    }

    /// Runs until shutdown, or until a fatal error.
    pub fn run(&mut self) -> Result<ProducerStats, PipelineError> {
        let mut failures = 0u32;
        let mut resync = self.config.resync;
        info!(stream = self.stream.name(), resync, "change producer started");
        'connect: while !self.shutdown.is_triggered() {
            let start = if resync {
                self.config.initial_start.clone()
            } else {
                match self.checkpoint.load()? {
                    Some(position) => FeedStart::Resume(position),
                    None => self.config.initial_start.clone(),
                }
            };
            let mut changes = match self.feed.open(&start) {
                Ok(changes) => changes,
                Err(err) => {
                    self.handle_feed_error(err, &start, &mut failures)?;
                    continue 'connect;
                }
            };
            debug!(?start, "change feed opened");
            resync = false;
            while !self.shutdown.is_triggered() {
                match changes.next(self.config.poll_timeout) {
                    Ok(None) => {}
                    Ok(Some(change)) => {
                        failures = 0;
                        self.publish(change)?;
                    }
                    Err(FeedError::Malformed {
                        position,
                        raw,
                        reason,
                    }) => self.reject(position, raw, reason)?,
                    Err(err) => {
                        self.handle_feed_error(err, &start, &mut failures)?;
                        continue 'connect;
                    }
                }
            }
        }
        info!(stats = ?self.stats, "change producer stopped");
        Ok(self.stats)
    }

    /// Appends one change, then advances the checkpoint.
    pub fn publish(&mut self, change: SourceChange) -> Result<(), PipelineError> {
        let event = change.into_event();
        let id = self.stream.append_json(&event).map_err(|err| {
            if matches!(err, StreamError::Exhausted(_)) {
                error!(stream = self.stream.name(), error = %err, "stage-1 storage exhausted, trim or drain required");
            }
            err
        })?;
        self.checkpoint.save(&event.resume_position)?;
        self.stats.appended += 1;
        debug!(
            id = %id,
            event_id = %event.event_id,
            document_id = %event.document_id,
            operation = %event.change.operation(),
            "appended change event"
        );
        if let Some(max_len) = self.config.trim_max_len {
            if self.stats.appended % self.config.trim_every.max(1) == 0 {
                let removed = self.stream.trim(max_len)?;
                self.stats.trimmed += removed;
                if removed > 0 {
                    info!(stream = self.stream.name(), removed, max_len, "trimmed stage-1");
                }
            }
        }
        Ok(())
    }

    /// Dead-letters a change the feed could not read, then advances the
    /// checkpoint past it.
    fn reject(
        &mut self,
        position: ResumePosition,
        raw: String,
        reason: String,
    ) -> Result<(), PipelineError> {
        let record = DeadLetter {
            source_stream: self.stream.name().to_string(),
            group: PRODUCER_GROUP.to_string(),
            stream_id: None,
            delivery_count: 0,
            reason: format!("unreadable change at {position}: {reason}"),
            failed_at_ms: self.stream.store().now_ms(),
            body: raw,
        };
        let dead_id = self.dead_letters.append_json(&record)?;
        self.checkpoint.save(&position)?;
        self.stats.rejected += 1;
        warn!(
            %position,
            dead_letter_id = %dead_id,
            reason = %record.reason,
            "dead-lettered unreadable change"
        );
        Ok(())
    }

    fn handle_feed_error(
        &mut self,
        err: FeedError,
        start: &FeedStart,
        failures: &mut u32,
    ) -> Result<(), PipelineError> {
        let err = PipelineError::from(err);
        if err.class() != ErrorClass::TransientUpstream {
            if let PipelineError::ResumeInvalid { position, reason } = &err {
                error!(%position, %reason, "resume position rejected, run a resync");
            }
            return Err(err);
        }
        *failures += 1;
        if *failures > self.config.max_reconnects {
            return Err(PipelineError::ReconnectsExhausted {
                attempts: *failures - 1,
                last: err.to_string(),
            });
        }
        let delay = self.config.backoff(*failures);
        let resume = match start {
            FeedStart::Resume(ResumePosition(position)) => position.as_str(),
            FeedStart::Now => "now",
            FeedStart::Beginning => "beginning",
        };
        warn!(
            error = %err,
            attempt = *failures,
            delay_ms = delay.as_millis() as u64,
            resume,
            "change feed failed, reconnecting"
        );
        self.stats.reconnects += 1;
        self.shutdown.sleep(delay);
        Ok(())
    }
}
