//! Records carried by the two pipeline streams.
//!
//! Stage 1 carries [`ChangeEvent`]s produced from the source change feed;
//! stage 2 carries [`EmbeddedDocument`]s produced by the embedding stage.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::stream::StreamId;

/// Raw field snapshot of a source document.
pub type Payload = Map<String, Value>;

/// Source cluster time of a change: seconds plus an increment within the second.
///
/// The source hands these out in strictly increasing order, which makes it the
/// total order used to decide which embedding of a document is newest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SourceTimestamp {
    /// Seconds since the Unix epoch.
    pub seconds: u32,
    /// Ordinal within `seconds`.
    pub increment: u32,
}

impl SourceTimestamp {
    /// Builds a timestamp from its parts.
    pub const fn new(seconds: u32, increment: u32) -> Self {
        Self { seconds, increment }
    }

    /// Version stamped onto every embedding derived from this change.
    pub fn version(self) -> EmbeddingVersion {
        EmbeddingVersion(((self.seconds as u64) << 32) | self.increment as u64)
    }
}

/// Totally ordered version of an embedding; higher wins at the index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EmbeddingVersion(pub u64);

impl fmt::Display for EmbeddingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token that resumes the source change feed right after a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumePosition(pub String);

impl fmt::Display for ResumePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of source change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Document created.
    Insert,
    /// Document replaced or modified.
    Update,
    /// Document removed.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

/// A change with its payload; deletes carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Change {
    /// New document snapshot.
    Insert {
        /// Full field snapshot.
        payload: Payload,
    },
    /// Updated document snapshot.
    Update {
        /// Full field snapshot after the update.
        payload: Payload,
    },
    /// Document removal.
    Delete,
}

impl Change {
    /// Operation tag of the change.
    pub fn operation(&self) -> Operation {
        match self {
            Change::Insert { .. } => Operation::Insert,
            Change::Update { .. } => Operation::Update,
            Change::Delete => Operation::Delete,
        }
    }

    /// Field snapshot for inserts and updates.
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Change::Insert { payload } | Change::Update { payload } => Some(payload),
            Change::Delete => None,
        }
    }
}

/// Stage-1 record: one change observed on the source store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Source-assigned unique id.
    pub event_id: String,
    /// Operation and payload.
    #[serde(flatten)]
    pub change: Change,
    /// Id of the changed document.
    pub document_id: String,
    /// Cluster time of the change.
    pub source_timestamp: SourceTimestamp,
    /// Feed position just after this change.
    pub resume_position: ResumePosition,
}

impl ChangeEvent {
    /// Version any embedding of this event carries.
    pub fn embedding_version(&self) -> EmbeddingVersion {
        self.source_timestamp.version()
    }
}

/// Stage-2 record: an embedding (or deletion marker) for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedDocument {
    /// Id of the embedded document.
    pub document_id: String,
    /// Embedding vector; absent on tombstones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    /// Fields kept for filtering and display.
    #[serde(default)]
    pub metadata: Payload,
    /// Change event this record was derived from.
    pub source_event_id: String,
    /// Ordering key used by the index guard.
    pub embedding_version: EmbeddingVersion,
    /// Whether this record marks a deletion.
    #[serde(default)]
    pub tombstone: bool,
}

impl EmbeddedDocument {
    /// Embedding produced for an insert or update.
    pub fn embedded(event: &ChangeEvent, vector: Vec<f32>, metadata: Payload) -> Self {
        Self {
            document_id: event.document_id.clone(),
            vector: Some(vector),
            metadata,
            source_event_id: event.event_id.clone(),
            embedding_version: event.embedding_version(),
            tombstone: false,
        }
    }

    /// Deletion marker for a delete event.
    pub fn tombstone(event: &ChangeEvent) -> Self {
        Self {
            document_id: event.document_id.clone(),
            vector: None,
            metadata: Payload::new(),
            source_event_id: event.event_id.clone(),
            embedding_version: event.embedding_version(),
            tombstone: true,
        }
    }

    /// What the index should do with this record.
    pub fn action(&self) -> Result<IndexAction<'_>, MalformedDocument> {
        match (self.tombstone, self.vector.as_deref()) {
            (true, None) => Ok(IndexAction::Delete),
            (false, Some(vector)) if !vector.is_empty() => Ok(IndexAction::Upsert { vector }),
            (true, Some(_)) => Err(MalformedDocument::TombstoneWithVector(
                self.document_id.clone(),
            )),
            (false, _) => Err(MalformedDocument::MissingVector(self.document_id.clone())),
        }
    }
}

/// Index operation implied by an [`EmbeddedDocument`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndexAction<'a> {
    /// Store the vector under the document id.
    Upsert {
        /// Vector to store.
        vector: &'a [f32],
    },
    /// Remove the document.
    Delete,
}

/// Stage-2 record whose shape contradicts its tombstone flag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedDocument {
    /// A live record with no vector.
    #[error("document {0} has no vector and is not a tombstone")]
    MissingVector(String),
    /// A tombstone that still carries a vector.
    #[error("tombstone for document {0} carries a vector")]
    TombstoneWithVector(String),
}

/// Terminal record for an entry that kept failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Stream the entry came from.
    pub source_stream: String,
    /// Group that gave up on it.
    pub group: String,
    /// Id of the entry in `source_stream`; `None` when it never made it in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    /// Deliveries attempted.
    pub delivery_count: u32,
    /// Last failure.
    pub reason: String,
    /// Epoch milliseconds when the entry was dead-lettered.
    pub failed_at_ms: u64,
    /// Original entry body.
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn event(change: Change) -> ChangeEvent {
        ChangeEvent {
            event_id: "evt-1".into(),
            change,
            document_id: "doc-a".into(),
            source_timestamp: SourceTimestamp::new(1_700_000_000, 3),
            resume_position: ResumePosition("128".into()),
        }
    }

    #[test]
    fn change_event_wire_shape_ties_payload_to_operation() {
        let mut payload = Payload::new();
        payload.insert("subject".into(), json!("hello"));
        let insert = serde_json::to_value(event(Change::Insert { payload })).unwrap();
        assert_eq!(
            insert,
            json!({
                "event_id": "evt-1",
                "operation": "insert",
                "payload": {"subject": "hello"},
                "document_id": "doc-a",
                "source_timestamp": {"seconds": 1_700_000_000u32, "increment": 3},
                "resume_position": "128"
            })
        );

        let delete = serde_json::to_value(event(Change::Delete)).unwrap();
        assert_eq!(delete["operation"], "delete");
        assert!(delete.get("payload").is_none());

        let decoded: ChangeEvent = serde_json::from_value(delete).unwrap();
        assert_eq!(decoded.change, Change::Delete);
    }

    #[test]
    fn insert_without_payload_is_rejected() {
        let raw = json!({
            "event_id": "e",
            "operation": "insert",
            "document_id": "d",
            "source_timestamp": {"seconds": 1, "increment": 0},
            "resume_position": "0"
        });
        assert!(serde_json::from_value::<ChangeEvent>(raw).is_err());
    }

    #[test]
    fn versions_follow_cluster_time_order() {
        let a = SourceTimestamp::new(10, 5).version();
        let b = SourceTimestamp::new(10, 6).version();
        let c = SourceTimestamp::new(11, 0).version();
        assert!(a < b && b < c);
    }

    #[test]
    fn tombstones_have_no_vector() {
        let tombstone = EmbeddedDocument::tombstone(&event(Change::Delete));
        assert_eq!(tombstone.action(), Ok(IndexAction::Delete));
        let wire = serde_json::to_value(&tombstone).unwrap();
        assert!(wire.get("vector").is_none());
        assert_eq!(wire["tombstone"], true);

        let mut broken = tombstone.clone();
        broken.tombstone = false;
        assert!(matches!(
            broken.action(),
            Err(MalformedDocument::MissingVector(_))
        ));
    }
}
