use crate::models::{ChunkId, DocumentId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("pdf parse failed after {attempts} attempt(s): {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("invalid status transition for {document_id}: {from} -> {to}")]
    InvalidTransition {
        document_id: DocumentId,
        from: crate::models::DocumentStatus,
        to: crate::models::DocumentStatus,
    },

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for IngestError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::DocumentNotFound(document_id) => IngestError::DocumentNotFound(document_id),
            other => IngestError::Store(other),
        }
    }
}

impl IngestError {
    /// Only transient PDF decode failures are worth another extraction attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::PdfParse(_))
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    #[error("embedding request rejected: {0}")]
    Rejected(String),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid embedding config: {0}")]
    Config(String),
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Unavailable(_))
    }
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
            EmbeddingError::Unavailable(error.to_string())
        } else {
            EmbeddingError::Rejected(error.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("chunk not found: {0}")]
    ChunkNotFound(ChunkId),

    #[error("vector dimension {actual} does not match store dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid chunk record: {0}")]
    InvalidRecord(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("malformed storage reference: {0}")]
    InvalidStorageRef(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("embedding provider returned no vector for the query")]
    EmptyEmbedding,
}
