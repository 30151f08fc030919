use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_SEARCH_LIMIT: usize = 5;
pub const DEFAULT_PAGE_WINDOW: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChunkId(Uuid);

impl ChunkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChunkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque user identifier handed over by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Uploaded,
    Processing,
    Processed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Failed => "failed",
        }
    }

    /// Same-state transitions are accepted.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        if *self == next {
            return true;
        }

        matches!(
            (self, next),
            (DocumentStatus::Uploaded, DocumentStatus::Processing)
                | (DocumentStatus::Processing, DocumentStatus::Processed)
                | (DocumentStatus::Processing, DocumentStatus::Failed)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "uploaded" => Ok(DocumentStatus::Uploaded),
            "processing" => Ok(DocumentStatus::Processing),
            "processed" => Ok(DocumentStatus::Processed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(format!("unknown document status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub owner_id: OwnerId,
    pub name: String,
    pub size_bytes: u64,
    pub storage_ref: String,
    pub uploaded_at: DateTime<Utc>,
    pub status: DocumentStatus,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub owner_id: OwnerId,
    pub name: String,
    pub size_bytes: u64,
    pub storage_ref: String,
}

/// Chunker output, before the store assigns an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub text: String,
    pub page: u32,
    pub position: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub owner_id: OwnerId,
    pub text: String,
    pub page: u32,
    pub position: u64,
    pub embedding: Option<Vec<f32>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Chunk {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorMatch {
    pub chunk_id: ChunkId,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub owner_id: OwnerId,
    pub limit: usize,
    pub document_id: Option<DocumentId>,
    pub include_context: bool,
    pub page_window: u32,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, owner_id: OwnerId) -> Self {
        Self {
            text: text.into(),
            owner_id,
            limit: DEFAULT_SEARCH_LIMIT,
            document_id: None,
            include_context: false,
            page_window: DEFAULT_PAGE_WINDOW,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn in_document(mut self, document_id: DocumentId) -> Self {
        self.document_id = Some(document_id);
        self
    }

    pub fn with_context(mut self, include_context: bool) -> Self {
        self.include_context = include_context;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub document: Document,
    pub context: Vec<Chunk>,
    /// Native store score; never re-normalized.
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_parse_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 200,
            max_parse_attempts: 3,
            retry_base_delay: Duration::from_millis(1_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionReport {
    pub document_id: DocumentId,
    pub chunks_inserted: usize,
    pub embedded: usize,
    pub failed: usize,
    pub status: DocumentStatus,
}
