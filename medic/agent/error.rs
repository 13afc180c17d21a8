use std::time::Duration;

use thiserror::Error;

use crate::model::EvidenceSource;

/// Failures of the language-model collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    /// Network, auth or protocol failure.
    #[error("language model unavailable: {0}")]
    Unavailable(String),
    /// Deadline exceeded.
    #[error("language model timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures of a search backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Transport failure or non-success status.
    #[error("backend request failed: {0}")]
    Request(String),
    /// Response body did not match the expected shape.
    #[error("backend response malformed: {0}")]
    Malformed(String),
}

/// Failures of the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Filesystem failure.
    #[error("checkpoint io failed: {0}")]
    Io(#[from] std::io::Error),
    /// Stored state could not be encoded or decoded.
    #[error("checkpoint encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
    /// Session key unusable as a storage name.
    #[error("invalid session key '{0}'")]
    InvalidKey(String),
}

/// Startup configuration failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Required credential is not set.
    #[error("missing required credential {0}")]
    MissingCredential(&'static str),
    /// Value present but unparsable.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Environment variable.
        key: &'static str,
        /// Offending value.
        value: String,
    },
    /// Unknown language-model provider name.
    #[error("unknown language model provider '{0}'")]
    UnknownProvider(String),
}

/// Errors raised by agent components. The orchestrator maps every variant to a
/// state transition; none reaches the caller.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Query text empty after trimming.
    #[error("query text is empty")]
    InvalidQuery,
    /// Classifier answer could not be decoded.
    #[error("classification ambiguous: {0}")]
    ClassificationAmbiguous(String),
    /// Search backend failed or timed out.
    #[error("{backend} unavailable: {detail}")]
    SourceUnavailable {
        /// Backend that failed.
        backend: EvidenceSource,
        /// Failure detail.
        detail: String,
    },
    /// Refiner returned nothing new.
    #[error("refinement degenerate: {0}")]
    RefinementDegenerate(String),
    /// Language model deadline exceeded.
    #[error("model timeout after {0:?}")]
    ModelTimeout(Duration),
    /// Language model unreachable.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    /// Request cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,
    /// Another request currently owns the session key.
    #[error("session '{0}' is already being written")]
    SessionBusy(String),
    /// Mutation attempted on a finished session.
    #[error("session is terminal")]
    SessionTerminal,
    /// Checkpoint store failure.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// Startup configuration failure.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl From<ModelError> for AgentError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Unavailable(detail) => Self::ModelUnavailable(detail),
            ModelError::Timeout(after) => Self::ModelTimeout(after),
        }
    }
}

impl AgentError {
    /// Wraps a failure of `backend`.
    #[must_use]
    pub fn source_unavailable(backend: EvidenceSource, err: &BackendError) -> Self {
        Self::SourceUnavailable {
            backend,
            detail: err.to_string(),
        }
    }

    /// True for language-model failures (timeout or unavailable).
    #[must_use]
    pub const fn is_model_failure(&self) -> bool {
        matches!(self, Self::ModelTimeout(_) | Self::ModelUnavailable(_))
    }
}

/// Convenience alias.
pub type AgentResult<T> = Result<T, AgentError>;
