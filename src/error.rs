//! Pipeline-wide error taxonomy.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::embedder::ServiceError;
use crate::event::ResumePosition;
use crate::index::IndexError;
use crate::source::FeedError;
use crate::stream::StreamError;

/// How the pipeline reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Source feed trouble: reconnect with backoff and resume from the checkpoint.
    TransientUpstream,
    /// Embedding service or index trouble: leave the entry pending for reclaim.
    TransientDownstream,
    /// Input no downstream will ever accept: dead-letter and ack.
    PoisonMessage,
    /// Needs an operator: halt the process.
    Fatal,
}

/// Any failure a pipeline component can report.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The change feed dropped or could not be opened.
    #[error("change feed unavailable: {0}")]
    FeedUnavailable(String),
    /// The change feed kept failing past the reconnect budget.
    #[error("change feed still failing after {attempts} reconnect attempts: {last}")]
    ReconnectsExhausted {
        /// Consecutive failed attempts.
        attempts: u32,
        /// Last failure observed.
        last: String,
    },
    /// The source no longer accepts the stored resume position.
    #[error("resume position {position} rejected by the source ({reason}); a full resync is required")]
    ResumeInvalid {
        /// Rejected position.
        position: ResumePosition,
        /// Source explanation.
        reason: String,
    },
    /// The stream store failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// The producer checkpoint could not be read or written.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// The embedding service failed.
    #[error(transparent)]
    Embedding(#[from] ServiceError),
    /// The vector index failed.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// The entry can never be processed.
    #[error("poison message: {0}")]
    Poison(String),
}

impl PipelineError {
    /// Reaction class of this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::FeedUnavailable(_) => ErrorClass::TransientUpstream,
            PipelineError::ReconnectsExhausted { .. }
            | PipelineError::ResumeInvalid { .. }
            | PipelineError::Checkpoint(_) => ErrorClass::Fatal,
            PipelineError::Stream(StreamError::Codec(_)) => ErrorClass::PoisonMessage,
            PipelineError::Stream(_) => ErrorClass::Fatal,
            PipelineError::Embedding(err) if err.is_transient() => {
                ErrorClass::TransientDownstream
            }
            PipelineError::Embedding(_) => ErrorClass::PoisonMessage,
            PipelineError::Index(IndexError::Unavailable(_)) => ErrorClass::TransientDownstream,
            PipelineError::Index(IndexError::MissingCollection(_)) => ErrorClass::Fatal,
            PipelineError::Index(IndexError::Rejected { .. }) => ErrorClass::PoisonMessage,
            PipelineError::Poison(_) => ErrorClass::PoisonMessage,
        }
    }

    /// Whether the process should stop.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

impl From<FeedError> for PipelineError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::Transient(reason) => PipelineError::FeedUnavailable(reason),
            FeedError::ResumeInvalid { position, reason } => {
                PipelineError::ResumeInvalid { position, reason }
            }
            FeedError::Malformed {
                position, reason, ..
            } => PipelineError::Poison(format!("change at {position}: {reason}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_the_taxonomy() {
        assert_eq!(
            PipelineError::from(FeedError::Transient("reset".into())).class(),
            ErrorClass::TransientUpstream
        );
        assert_eq!(
            PipelineError::from(FeedError::ResumeInvalid {
                position: ResumePosition("9000".into()),
                reason: "log truncated".into(),
            })
            .class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            PipelineError::from(StreamError::Exhausted("full".into())).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            PipelineError::from(ServiceError::Unavailable("503".into())).class(),
            ErrorClass::TransientDownstream
        );
        assert_eq!(
            PipelineError::from(ServiceError::Rejected {
                status: 422,
                body: "bad text".into()
            })
            .class(),
            ErrorClass::PoisonMessage
        );
        assert_eq!(
            PipelineError::from(IndexError::Unavailable("refused".into())).class(),
            ErrorClass::TransientDownstream
        );
        assert_eq!(
            PipelineError::from(IndexError::MissingCollection("documents".into())).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            PipelineError::from(FeedError::Malformed {
                position: ResumePosition("40".into()),
                raw: "garbage".into(),
                reason: "expected value".into(),
            })
            .class(),
            ErrorClass::PoisonMessage
        );
        assert!(PipelineError::ReconnectsExhausted {
            attempts: 10,
            last: "reset".into()
        }
        .is_fatal());
    }
}
