//! Qdrant REST backend.
//!
//! Points live in the configured collection; every delete additionally writes a
//! one-dimensional marker point into `<collection>_tombstones` so that the
//! delete's version outlives the point it removed.
//!
//! Qdrant has no compare-and-set, so conditional writes hold a per-document
//! lock across the version lookup and the write. Clones share the locks.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use url::Url;
use uuid::Uuid;

use super::{IndexDeletion, IndexError, IndexRecord, SearchMatch, VectorIndex};
use crate::event::{EmbeddingVersion, Payload};

const DOCUMENT_ID_FIELD: &str = "document_id";
const VERSION_FIELD: &str = "embedding_version";
const SOURCE_EVENT_FIELD: &str = "source_event_id";
const LOCK_STRIPES: usize = 64;

/// Striped per-document write locks.
struct DocumentLocks {
    stripes: Vec<Mutex<()>>,
}

impl DocumentLocks {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, document_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        document_id.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Locks every stripe the documents map to, in ascending order so that
    /// overlapping batches cannot deadlock.
    fn lock_all<'a>(
        &self,
        document_ids: impl IntoIterator<Item = &'a str>,
    ) -> Vec<MutexGuard<'_, ()>> {
        let mut stripes: Vec<usize> = document_ids
            .into_iter()
            .map(|id| self.stripe(id))
            .collect();
        stripes.sort_unstable();
        stripes.dedup();
        stripes.into_iter().map(|stripe| self.stripes[stripe].lock()).collect()
    }
}

/// Blocking Qdrant client bound to one collection.
#[derive(Clone)]
pub struct QdrantIndex {
    client: Client,
    base_url: String,
    collection: String,
    tombstones: String,
    locks: Arc<DocumentLocks>,
}

impl QdrantIndex {
    /// Builds a client for `collection` on the Qdrant instance at `base_url`.
    pub fn new(
        base_url: &str,
        collection: &str,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .with_context(|| format!("invalid Qdrant URL {base_url:?}"))?;
        anyhow::ensure!(
            matches!(parsed.scheme(), "http" | "https"),
            "Qdrant URL must be http(s)"
        );
        anyhow::ensure!(!collection.trim().is_empty(), "missing Qdrant collection name");
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key.map(str::trim).filter(|key| !key.is_empty()) {
            headers.insert(
                "api-key",
                HeaderValue::from_str(key).context("invalid Qdrant API key")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Qdrant HTTP client")?;
        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            tombstones: format!("{collection}_tombstones"),
            locks: Arc::new(DocumentLocks::new()),
        })
    }

    /// Creates the point and tombstone collections when missing.
    pub fn ensure_collections(&self, dimensions: usize) -> Result<()> {
        anyhow::ensure!(dimensions > 0, "embedding dimension must be positive");
        self.ensure_collection(&self.collection, dimensions)?;
        self.ensure_tombstones()
    }

    /// Creates the tombstone collection when missing. Its markers are
    /// one-dimensional, so this needs no embedding width.
    pub fn ensure_tombstones(&self) -> Result<()> {
        self.ensure_collection(&self.tombstones, 1)
    }

    /// Number of points in the main collection.
    pub fn points_count(&self) -> Result<u64, IndexError> {
        let resp = self
            .client
            .get(self.url(&format!("collections/{}", self.collection)))
            .send()
            .map_err(unavailable)?;
        let info: QdrantResponse<CollectionInfo> = parse(resp)?;
        Ok(info.result.points_count.unwrap_or(0))
    }

    fn ensure_collection(&self, name: &str, size: usize) -> Result<()> {
        let url = self.url(&format!("collections/{name}"));
        let resp = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("failed to query Qdrant collection {name}"))?;
        if resp.status().is_success() {
            return Ok(());
        }
        anyhow::ensure!(
            resp.status() == StatusCode::NOT_FOUND,
            "unexpected status {} while checking collection {name}",
            resp.status()
        );
        let body = json!({"vectors": {"size": size, "distance": "Cosine"}});
        let resp = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .with_context(|| format!("failed to create Qdrant collection {name}"))?;
        let status = resp.status();
        anyhow::ensure!(
            status.is_success(),
            "creating collection {name} failed ({status}): {}",
            resp.text().unwrap_or_default()
        );
        info!(collection = name, size, "created Qdrant collection");
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn upsert_points(&self, collection: &str, points: Vec<Point>) -> Result<(), IndexError> {
        if points.is_empty() {
            return Ok(());
        }
        let resp = self
            .client
            .put(self.url(&format!("collections/{collection}/points?wait=true")))
            .json(&UpsertRequest { points })
            .send()
            .map_err(unavailable)?;
        let _: QdrantResponse<Value> = parse(resp)?;
        Ok(())
    }

    fn version_in(&self, collection: &str, point_id: Uuid) -> Result<Option<u64>, IndexError> {
        let resp = self
            .client
            .post(self.url(&format!("collections/{collection}/points")))
            .json(&json!({"ids": [point_id], "with_payload": [VERSION_FIELD], "with_vector": false}))
            .send()
            .map_err(unavailable)?;
        let found: QdrantResponse<Vec<RetrievedPoint>> = parse(resp)?;
        Ok(found
            .result
            .iter()
            .filter_map(|point| point.payload.get(VERSION_FIELD).and_then(Value::as_u64))
            .max())
    }

    fn write_records<'a>(
        &self,
        records: impl Iterator<Item = &'a IndexRecord>,
    ) -> Result<(), IndexError> {
        let points = records
            .map(|record| {
                let mut payload = record.metadata.clone();
                payload.insert(DOCUMENT_ID_FIELD.into(), json!(record.document_id));
                payload.insert(VERSION_FIELD.into(), json!(record.version.0));
                payload.insert(SOURCE_EVENT_FIELD.into(), json!(record.source_event_id));
                Point {
                    id: point_id(&record.document_id),
                    vector: record.vector.clone(),
                    payload,
                }
            })
            .collect();
        self.upsert_points(&self.collection, points)
    }

    /// Items whose version beats the applied one, keeping only the newest
    /// per document. Callers hold the document locks.
    fn newer<'a, T>(
        &self,
        items: &'a [T],
        key: impl Fn(&'a T) -> (&'a str, EmbeddingVersion),
    ) -> Result<Vec<&'a T>, IndexError> {
        let mut best: HashMap<&'a str, (Option<EmbeddingVersion>, Option<usize>)> = HashMap::new();
        for (pos, item) in items.iter().enumerate() {
            let (document_id, version) = key(item);
            let slot = match best.entry(document_id) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => slot.insert((self.applied_version(document_id)?, None)),
            };
            if Some(version) > slot.0 {
                *slot = (Some(version), Some(pos));
            }
        }
        let mut winners: Vec<usize> = best.into_values().filter_map(|(_, pos)| pos).collect();
        winners.sort_unstable();
        Ok(winners.into_iter().map(|pos| &items[pos]).collect())
    }
}

/// Deterministic point id for a source document id.
pub fn point_id(document_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, document_id.as_bytes())
}

impl VectorIndex for QdrantIndex {
    fn applied_version(
        &self,
        document_id: &str,
    ) -> Result<Option<EmbeddingVersion>, IndexError> {
        let id = point_id(document_id);
        let live = self.version_in(&self.collection, id)?;
        // No tombstone collection yet means nothing was ever deleted.
        let deleted = match self.version_in(&self.tombstones, id) {
            Err(IndexError::MissingCollection(_)) => None,
            other => other?,
        };
        Ok(live.max(deleted).map(EmbeddingVersion))
    }

    fn upsert(&self, records: &[IndexRecord]) -> Result<(), IndexError> {
        self.write_records(records.iter())
    }

    fn upsert_if_newer(&self, records: &[IndexRecord]) -> Result<usize, IndexError> {
        let _locked = self
            .locks
            .lock_all(records.iter().map(|record| record.document_id.as_str()));
        let winners = self.newer(records, |record| (record.document_id.as_str(), record.version))?;
        self.write_records(winners.iter().copied())?;
        Ok(winners.len())
    }

    fn delete_if_newer(&self, deletions: &[IndexDeletion]) -> Result<usize, IndexError> {
        let _locked = self
            .locks
            .lock_all(deletions.iter().map(|deletion| deletion.document_id.as_str()));
        let winners: Vec<IndexDeletion> = self
            .newer(deletions, |deletion| (deletion.document_id.as_str(), deletion.version))?
            .into_iter()
            .cloned()
            .collect();
        self.delete(&winners)?;
        Ok(winners.len())
    }

    fn delete(&self, deletions: &[IndexDeletion]) -> Result<(), IndexError> {
        if deletions.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = deletions
            .iter()
            .map(|deletion| point_id(&deletion.document_id))
            .collect();
        let resp = self
            .client
            .post(self.url(&format!(
                "collections/{}/points/delete?wait=true",
                self.collection
            )))
            .json(&json!({ "points": ids }))
            .send()
            .map_err(unavailable)?;
        let _: QdrantResponse<Value> = parse(resp)?;
        let markers = deletions
            .iter()
            .map(|deletion| {
                let mut payload = Payload::new();
                payload.insert(DOCUMENT_ID_FIELD.into(), json!(deletion.document_id));
                payload.insert(VERSION_FIELD.into(), json!(deletion.version.0));
                Point {
                    id: point_id(&deletion.document_id),
                    vector: vec![0.0],
                    payload,
                }
            })
            .collect();
        self.upsert_points(&self.tombstones, markers)
    }

    fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchMatch>, IndexError> {
        let resp = self
            .client
            .post(self.url(&format!("collections/{}/points/search", self.collection)))
            .json(&json!({"vector": vector, "limit": limit, "with_payload": true}))
            .send()
            .map_err(unavailable)?;
        let hits: QdrantResponse<Vec<ScoredPoint>> = parse(resp)?;
        Ok(hits
            .result
            .into_iter()
            .map(|hit| SearchMatch {
                document_id: hit
                    .payload
                    .get(DOCUMENT_ID_FIELD)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| hit.id.to_string()),
                score: hit.score,
                metadata: hit.payload,
            })
            .collect())
    }
}

fn unavailable(err: reqwest::Error) -> IndexError {
    IndexError::Unavailable(err.to_string())
}

fn parse<T: for<'de> Deserialize<'de>>(resp: Response) -> Result<T, IndexError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json()
            .map_err(|err| IndexError::Unavailable(format!("unreadable Qdrant response: {err}")));
    }
    let body = resp
        .text()
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(IndexError::Unavailable(format!("{status}: {body}")))
    } else if status == StatusCode::NOT_FOUND {
        Err(IndexError::MissingCollection(body))
    } else {
        Err(IndexError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Serialize)]
struct Point {
    id: Uuid,
    vector: Vec<f32>,
    payload: Payload,
}

#[derive(Serialize)]
struct UpsertRequest {
    points: Vec<Point>,
}

#[derive(Debug, Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    #[serde(default)]
    points_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RetrievedPoint {
    #[serde(default)]
    payload: Payload,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Payload,
}
