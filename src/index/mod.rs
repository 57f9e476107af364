//! Vector index backends.

pub mod memory;
pub mod qdrant;

use std::sync::Arc;

use thiserror::Error;

use crate::event::{EmbeddingVersion, Payload};

pub use memory::MemoryIndex;
pub use qdrant::QdrantIndex;

/// Failure talking to the vector index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The index could not be reached, timed out, or reported overload.
    #[error("vector index unavailable: {0}")]
    Unavailable(String),
    /// The index refused the request.
    #[error("vector index rejected request ({status}): {body}")]
    Rejected {
        /// HTTP status returned.
        status: u16,
        /// Error body returned.
        body: String,
    },
    /// The collection the request addressed does not exist.
    #[error("vector index collection missing: {0}")]
    MissingCollection(String),
}

/// Point written by an upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    /// Source document id.
    pub document_id: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Filter/display fields.
    pub metadata: Payload,
    /// Version of the embedding.
    pub version: EmbeddingVersion,
    /// Change event the embedding came from.
    pub source_event_id: String,
}

/// Removal of a document at a given version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDeletion {
    /// Source document id.
    pub document_id: String,
    /// Version of the delete.
    pub version: EmbeddingVersion,
}

/// One ranked search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchMatch {
    /// Source document id.
    pub document_id: String,
    /// Similarity score, higher is closer.
    pub score: f32,
    /// Stored metadata.
    pub metadata: Payload,
}

/// Upsert/delete-by-id vector store.
///
/// The `*_if_newer` calls compare and write as one step: two writers sharing
/// an index can never land an older version over a newer one, whatever the
/// interleaving.
pub trait VectorIndex: Send {
    /// Highest version applied for a document, deletes included.
    fn applied_version(&self, document_id: &str)
        -> Result<Option<EmbeddingVersion>, IndexError>;

    /// Writes points, replacing any existing point with the same document id.
    fn upsert(&self, records: &[IndexRecord]) -> Result<(), IndexError>;

    /// Removes documents and remembers the delete versions.
    fn delete(&self, deletions: &[IndexDeletion]) -> Result<(), IndexError>;

    /// Writes each record whose version is strictly newer than the
    /// document's applied version. Returns how many were written.
    fn upsert_if_newer(&self, records: &[IndexRecord]) -> Result<usize, IndexError>;

    /// Deletes each document whose applied version is older than the
    /// deletion's. Returns how many were applied.
    fn delete_if_newer(&self, deletions: &[IndexDeletion]) -> Result<usize, IndexError>;

    /// Nearest stored documents to `vector`.
    fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchMatch>, IndexError>;
}

impl<T: VectorIndex + Sync + ?Sized> VectorIndex for Arc<T> {
    fn applied_version(
        &self,
        document_id: &str,
    ) -> Result<Option<EmbeddingVersion>, IndexError> {
        (**self).applied_version(document_id)
    }

    fn upsert(&self, records: &[IndexRecord]) -> Result<(), IndexError> {
        (**self).upsert(records)
    }

    fn delete(&self, deletions: &[IndexDeletion]) -> Result<(), IndexError> {
        (**self).delete(deletions)
    }

    fn upsert_if_newer(&self, records: &[IndexRecord]) -> Result<usize, IndexError> {
        (**self).upsert_if_newer(records)
    }

    fn delete_if_newer(&self, deletions: &[IndexDeletion]) -> Result<usize, IndexError> {
        (**self).delete_if_newer(deletions)
    }

    fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchMatch>, IndexError> {
        (**self).search(vector, limit)
    }
}

/// Cosine similarity; `0.0` when either vector is zero or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
