//! Source-store change feeds.
//!
//! The pipeline only needs "ordered change events with a resumable position";
//! [`ChangeFeed`] is that seam and [`JsonlChangeFeed`] the bundled feed.

mod jsonl;

pub use jsonl::JsonlChangeFeed;

use std::time::Duration;

use thiserror::Error;

use crate::event::{Change, ChangeEvent, ResumePosition, SourceTimestamp};

/// Where to open a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStart {
    /// Continue right after a previously checkpointed change.
    Resume(ResumePosition),
    /// Only changes made from now on.
    Now,
    /// Everything the source still retains; used for a full resync.
    Beginning,
}

/// One change as observed on the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceChange {
    /// Source-assigned id, when the source provides one.
    pub event_id: Option<String>,
    /// Operation and document snapshot.
    pub change: Change,
    /// Changed document.
    pub document_id: String,
    /// Cluster time of the change.
    pub cluster_time: SourceTimestamp,
    /// Feed position right after this change.
    pub resume_position: ResumePosition,
}

impl SourceChange {
    /// Stage-1 record for this change. Without a source id the resume
    /// position, unique per change, stands in for it.
    pub fn into_event(self) -> ChangeEvent {
        let event_id = self
            .event_id
            .unwrap_or_else(|| self.resume_position.0.clone());
        ChangeEvent {
            event_id,
            change: self.change,
            document_id: self.document_id,
            source_timestamp: self.cluster_time,
            resume_position: self.resume_position,
        }
    }
}

/// Failure of the change feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Disconnect or similar; reopening from the checkpoint should work.
    #[error("change feed unavailable: {0}")]
    Transient(String),
    /// The source can no longer resume from `position`.
    #[error("resume position {position} is invalid: {reason}")]
    ResumeInvalid {
        /// Rejected position.
        position: ResumePosition,
        /// Why it was rejected.
        reason: String,
    },
    /// One change could not be read. The stream has already moved past it
    /// and keeps going.
    #[error("unreadable change at {position}: {reason}")]
    Malformed {
        /// Feed position right after the unreadable change.
        position: ResumePosition,
        /// Raw change as read from the source.
        raw: String,
        /// Why it could not be read.
        reason: String,
    },
}

/// Opens change streams over a source store.
pub trait ChangeFeed: Send {
    /// Starts streaming changes from `start`.
    fn open(&mut self, start: &FeedStart) -> Result<Box<dyn ChangeStream>, FeedError>;
}

/// An open, ordered stream of changes.
pub trait ChangeStream: Send {
    /// Next change, or `None` once `timeout` passes without one.
    fn next(&mut self, timeout: Duration) -> Result<Option<SourceChange>, FeedError>;
}
