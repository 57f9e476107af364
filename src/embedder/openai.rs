//! OpenAI-compatible embedding backend.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{validate_batch, EmbeddingService, ServiceError};

/// Blocking embeddings client that talks to OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    batch_size: usize,
}

impl OpenAiEmbedder {
    /// Builds a new OpenAI embeddings client.
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        dimensions: Option<usize>,
        timeout: Duration,
        batch_size: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing OpenAI model name");
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build OpenAI HTTP client")?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            dimensions,
            batch_size: batch_size.max(1),
        })
    }

    /// Maximum batch size configured for this client.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn request(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimensions,
        };
        let resp = self.client.post(&self.endpoint).json(&request).send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ServiceError::from_status(status, body));
        }
        let parsed: EmbeddingResponse = resp
            .json()
            .map_err(|err| ServiceError::Malformed(err.to_string()))?;
        Ok(parsed.into_vectors())
    }
}

impl EmbeddingService for OpenAiEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let mut vectors = Vec::with_capacity(inputs.len());
        for chunk in inputs.chunks(self.batch_size) {
            let embedded = self.request(chunk)?;
            validate_batch(&embedded, chunk.len(), None)?;
            vectors.extend(embedded);
        }
        validate_batch(&vectors, inputs.len(), self.dimensions)?;
        Ok(vectors)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

impl EmbeddingResponse {
    fn into_vectors(mut self) -> Vec<Vec<f32>> {
        self.data.sort_by_key(|entry| entry.index);
        self.data.into_iter().map(|entry| entry.embedding).collect()
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_is_reordered_by_index() {
        let parsed: EmbeddingResponse = serde_json::from_str(
            r#"{"data": [{"embedding": [2.0], "index": 1}, {"embedding": [1.0], "index": 0}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.into_vectors(), vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn requires_key_and_model() {
        let timeout = Duration::from_secs(1);
        assert!(OpenAiEmbedder::new(
            " ".into(),
            "https://api.openai.com/v1".into(),
            "m".into(),
            None,
            timeout,
            8
        )
        .is_err());
        let client = OpenAiEmbedder::new(
            "sk-test".into(),
            "https://api.openai.com/v1/".into(),
            "text-embedding-3-small".into(),
            Some(384),
            timeout,
            8,
        )
        .expect("valid client");
        assert_eq!(client.endpoint, "https://api.openai.com/v1/embeddings");
    }
}
