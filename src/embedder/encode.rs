//! Client for the self-hosted `/encode` embedding service.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{validate_batch, EmbeddingService, ServiceError};

/// Blocking client for `POST /encode` and `POST /encode_batch`.
///
/// Failed calls are returned as-is; retries happen by stream redelivery.
#[derive(Clone)]
pub struct EncodeServiceClient {
    client: Client,
    base_url: Url,
    dimensions: Option<usize>,
    batch_size: usize,
}

impl EncodeServiceClient {
    /// Builds a client for the service rooted at `base_url` (e.g. `http://10.0.0.5:8080`).
    pub fn new(
        base_url: &str,
        timeout: Duration,
        dimensions: Option<usize>,
        batch_size: usize,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .with_context(|| format!("invalid embedding service URL {base_url:?}"))?;
        anyhow::ensure!(
            matches!(base_url.scheme(), "http" | "https"),
            "embedding service URL must be http(s)"
        );
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build embedding service HTTP client")?;
        Ok(Self {
            client,
            base_url,
            dimensions,
            batch_size: batch_size.max(1),
        })
    }

    /// Maximum batch size configured for this client.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embeds a single text via `POST /encode`.
    pub fn encode(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let response: EncodeResponse = self.post("encode", &EncodeRequest { text })?;
        Ok(response.embedding)
    }

    /// Queries `GET /health`.
    pub fn health(&self) -> Result<ServiceHealth, ServiceError> {
        let resp = self.client.get(self.endpoint("health")).send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ServiceError::from_status(status, body));
        }
        Ok(resp.json()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ServiceError> {
        let resp = self.client.post(self.endpoint(path)).json(body).send()?;
        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .map_err(|err| ServiceError::Malformed(err.to_string()));
        }
        let body = resp
            .text()
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        Err(ServiceError::from_status(status, body))
    }
}

impl EmbeddingService for EncodeServiceClient {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let vectors = match inputs {
            [] => return Ok(Vec::new()),
            [single] => vec![self.encode(single)?],
            _ => {
                let mut vectors = Vec::with_capacity(inputs.len());
                for chunk in inputs.chunks(self.batch_size) {
                    let response: EncodeBatchResponse =
                        self.post("encode_batch", &EncodeBatchRequest { texts: chunk })?;
                    validate_batch(&response.embeddings, chunk.len(), None)?;
                    vectors.extend(response.embeddings);
                }
                vectors
            }
        };
        validate_batch(&vectors, inputs.len(), self.dimensions)?;
        Ok(vectors)
    }
}

/// `GET /health` answer.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceHealth {
    /// Service status string.
    pub status: String,
    /// Model served.
    #[serde(default)]
    pub model: Option<String>,
    /// Output dimensionality.
    #[serde(default)]
    pub vector_size: Option<usize>,
}

#[derive(Serialize)]
struct EncodeRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EncodeResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct EncodeBatchRequest<'a> {
    texts: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EncodeBatchResponse {
    embeddings: Vec<Vec<f32>>,
}
