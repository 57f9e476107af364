//! Durable append-only streams with consumer groups and pending-entry lists.
//!
//! A stream is an ordered log of [`StreamEntry`] values addressed by
//! monotonically increasing [`StreamId`]s. Consumer groups keep a delivery
//! cursor plus a pending-entry list (PEL) of delivered-but-unacknowledged
//! entries, which gives at-least-once, competing-consumer delivery:
//!
//! ```text
//! append ──► [undelivered] ──read──► [pending in PEL] ──ack──► [acknowledged]
//!                                        │  ▲
//!                                        └──┘ claim (ownership transfer, count+1)
//! ```
//!
//! Storage lives in SQLite so several processes can share one store file; each
//! read, claim, ack and trim runs as a single transaction.

mod id;
mod store;

pub use id::{InvalidStreamId, StreamId};
pub use store::{StoreOptions, Stream, StreamStore};

use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;

/// One immutable record of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Position of the entry within its stream.
    pub id: StreamId,
    /// Opaque serialized payload.
    pub body: String,
}

impl StreamEntry {
    /// Decodes the JSON body into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StreamError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// An entry handed to a consumer by `read` or `claim`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The delivered entry.
    pub entry: StreamEntry,
    /// How many times the entry has been handed out within the group, this one included.
    pub delivery_count: u32,
}

impl Delivery {
    /// Stream id of the delivered entry.
    pub fn id(&self) -> StreamId {
        self.entry.id
    }
}

/// PEL record for a delivered-but-unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Pending entry id.
    pub id: StreamId,
    /// Consumer that currently owns the entry.
    pub consumer: String,
    /// Epoch milliseconds of the latest delivery or claim.
    pub delivered_at_ms: u64,
    /// Number of deliveries so far.
    pub delivery_count: u32,
}

impl PendingEntry {
    /// Milliseconds the entry has been idle at `now_ms`.
    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.delivered_at_ms)
    }
}

/// Idle thresholds that decide when a pending entry may be claimed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueRule {
    /// Idle time required after the first delivery. Doubles per delivery.
    pub base_backoff: Duration,
    /// Upper bound of the doubling idle time.
    pub max_backoff: Duration,
    /// Minimum idle time before an entry owned by another consumer is taken.
    pub claim_idle: Duration,
}

/// Where a newly created group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Deliver every entry still present in the stream.
    Beginning,
    /// Deliver only entries appended after the group is created.
    Latest,
}

/// Consumer-group statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// Group name.
    pub name: String,
    /// Last delivered id.
    pub cursor: StreamId,
    /// Entries currently in the PEL.
    pub pending: u64,
    /// Entries past the cursor, never delivered to this group.
    pub undelivered: u64,
}

impl GroupInfo {
    /// Work the group still has to finish: pending plus undelivered.
    pub fn lag(&self) -> u64 {
        self.pending + self.undelivered
    }
}

/// Stream statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream name.
    pub name: String,
    /// Entries currently stored.
    pub length: u64,
    /// Entries ever appended, trimmed ones included.
    pub entries_added: u64,
    /// Oldest stored entry.
    pub first_id: Option<StreamId>,
    /// Last id ever assigned.
    pub last_id: Option<StreamId>,
    /// Consumer groups attached to the stream.
    pub groups: Vec<GroupInfo>,
}

/// Errors surfaced by the stream store.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The underlying database failed.
    #[error("stream storage error: {0}")]
    Storage(rusqlite::Error),
    /// The store has no room left for new entries.
    #[error("stream storage exhausted: {0}")]
    Exhausted(String),
    /// A body could not be serialized or deserialized.
    #[error("stream entry codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// The named group does not exist on the stream.
    #[error("consumer group {group} does not exist on stream {stream}")]
    UnknownGroup {
        /// Stream name.
        stream: String,
        /// Group name.
        group: String,
    },
    /// The named group already exists on the stream.
    #[error("consumer group {group} already exists on stream {stream}")]
    GroupExists {
        /// Stream name.
        stream: String,
        /// Group name.
        group: String,
    },
    /// A stored id could not be interpreted.
    #[error(transparent)]
    InvalidId(#[from] InvalidStreamId),
    /// The store handle was closed.
    #[error("stream store is closed")]
    Closed,
}

impl From<rusqlite::Error> for StreamError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DiskFull) => StreamError::Exhausted(err.to_string()),
            _ => StreamError::Storage(err),
        }
    }
}
