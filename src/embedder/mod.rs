//! Embedding service clients.

pub mod encode;
pub mod openai;

use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

/// Failure talking to the embedding service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service could not be reached, timed out, or reported overload.
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),
    /// The service refused the input.
    #[error("embedding service rejected input ({status}): {body}")]
    Rejected {
        /// HTTP status returned.
        status: u16,
        /// Error body returned.
        body: String,
    },
    /// The service answered with something that is not a usable embedding batch.
    #[error("malformed embedding response: {0}")]
    Malformed(String),
}

impl ServiceError {
    /// Whether retrying later might succeed without changing the input.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Unavailable(_) | ServiceError::Malformed(_))
    }

    pub(crate) fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ServiceError::Unavailable(format!("{status}: {body}"))
        } else {
            ServiceError::Rejected {
                status: status.as_u16(),
                body,
            }
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ServiceError::Malformed(err.to_string())
        } else {
            ServiceError::Unavailable(err.to_string())
        }
    }
}

/// Text → vector RPC.
pub trait EmbeddingService: Send {
    /// Embeds every input, returning one vector per input in input order.
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

impl<T: EmbeddingService + Sync + ?Sized> EmbeddingService for Arc<T> {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ServiceError> {
        (**self).embed_batch(inputs)
    }
}

impl<T: EmbeddingService + ?Sized> EmbeddingService for Box<T> {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ServiceError> {
        (**self).embed_batch(inputs)
    }
}

/// Checks that a response holds `expected` vectors, all of the configured width.
pub fn validate_batch(
    vectors: &[Vec<f32>],
    expected: usize,
    dimensions: Option<usize>,
) -> Result<(), ServiceError> {
    if vectors.len() != expected {
        return Err(ServiceError::Malformed(format!(
            "service returned {} embeddings for {} inputs",
            vectors.len(),
            expected
        )));
    }
    if let Some(dims) = dimensions {
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != dims) {
            return Err(ServiceError::Malformed(format!(
                "service returned a {}-dimensional vector, expected {}",
                bad.len(),
                dims
            )));
        }
    }
    Ok(())
}
