//! In-process index with last-write-wins slots and remembered deletes.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{
    cosine_similarity, IndexDeletion, IndexError, IndexRecord, SearchMatch, VectorIndex,
};
use crate::event::{EmbeddingVersion, Payload};

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Live {
        vector: Vec<f32>,
        metadata: Payload,
        version: EmbeddingVersion,
    },
    Deleted {
        version: EmbeddingVersion,
    },
}

impl Slot {
    fn version(&self) -> EmbeddingVersion {
        match self {
            Slot::Live { version, .. } | Slot::Deleted { version } => *version,
        }
    }
}

/// Stored state of one live document.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    /// Stored vector.
    pub vector: Vec<f32>,
    /// Stored metadata.
    pub metadata: Payload,
    /// Version that wrote the point.
    pub version: EmbeddingVersion,
}

/// Index kept in memory; used for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live point for a document, if any.
    pub fn get(&self, document_id: &str) -> Option<StoredPoint> {
        match self.slots.lock().get(document_id) {
            Some(Slot::Live {
                vector,
                metadata,
                version,
            }) => Some(StoredPoint {
                vector: vector.clone(),
                metadata: metadata.clone(),
                version: *version,
            }),
            _ => None,
        }
    }

    /// Number of live points.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Live { .. }))
            .count()
    }

    /// Whether no live point is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live document ids in sorted order.
    pub fn document_ids(&self) -> Vec<String> {
        let slots = self.slots.lock();
        let mut ids: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

fn supersedes(slots: &HashMap<String, Slot>, document_id: &str, version: EmbeddingVersion) -> bool {
    slots
        .get(document_id)
        .map_or(true, |slot| slot.version() < version)
}

fn live(record: &IndexRecord) -> Slot {
    Slot::Live {
        vector: record.vector.clone(),
        metadata: record.metadata.clone(),
        version: record.version,
    }
}

impl VectorIndex for MemoryIndex {
    fn applied_version(
        &self,
        document_id: &str,
    ) -> Result<Option<EmbeddingVersion>, IndexError> {
        Ok(self.slots.lock().get(document_id).map(Slot::version))
    }

    fn upsert(&self, records: &[IndexRecord]) -> Result<(), IndexError> {
        let mut slots = self.slots.lock();
        for record in records {
            slots.insert(record.document_id.clone(), live(record));
        }
        Ok(())
    }

    fn delete(&self, deletions: &[IndexDeletion]) -> Result<(), IndexError> {
        let mut slots = self.slots.lock();
        for deletion in deletions {
            slots.insert(
                deletion.document_id.clone(),
                Slot::Deleted {
                    version: deletion.version,
                },
            );
        }
        Ok(())
    }

    fn upsert_if_newer(&self, records: &[IndexRecord]) -> Result<usize, IndexError> {
        let mut slots = self.slots.lock();
        let mut written = 0;
        for record in records {
            if supersedes(&slots, &record.document_id, record.version) {
                slots.insert(record.document_id.clone(), live(record));
                written += 1;
            }
        }
        Ok(written)
    }

    fn delete_if_newer(&self, deletions: &[IndexDeletion]) -> Result<usize, IndexError> {
        let mut slots = self.slots.lock();
        let mut applied = 0;
        for deletion in deletions {
            if supersedes(&slots, &deletion.document_id, deletion.version) {
                slots.insert(
                    deletion.document_id.clone(),
                    Slot::Deleted {
                        version: deletion.version,
                    },
                );
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchMatch>, IndexError> {
        let slots = self.slots.lock();
        let mut matches: Vec<SearchMatch> = slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Live {
                    vector: stored,
                    metadata,
                    ..
                } => Some(SearchMatch {
                    document_id: id.clone(),
                    score: cosine_similarity(vector, stored),
                    metadata: metadata.clone(),
                }),
                Slot::Deleted { .. } => None,
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        matches.truncate(limit);
        Ok(matches)
    }
}
