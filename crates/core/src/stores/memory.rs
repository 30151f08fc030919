use crate::error::StoreError;
use crate::models::{
    Chunk, ChunkId, ChunkRecord, Document, DocumentId, DocumentStatus, NewDocument, OwnerId,
    VectorMatch,
};
use crate::store::{cosine_similarity, ChunkStore, DocumentStore};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

/// In-process document and chunk store with exact cosine-similarity search.
///
/// Chunks are kept in insertion order, which is the tie-breaker for equal
/// search scores. The whole state can be written to and restored from a
/// JSON snapshot.
pub struct MemoryStore {
    dimensions: usize,
    state: RwLock<StoreState>,
}

#[derive(Default)]
struct StoreState {
    documents: HashMap<DocumentId, Document>,
    chunks: BTreeMap<u64, Chunk>,
    sequence_by_id: HashMap<ChunkId, u64>,
    next_sequence: u64,
}

impl StoreState {
    fn push_chunk(&mut self, chunk: Chunk) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.sequence_by_id.insert(chunk.id, sequence);
        self.chunks.insert(sequence, chunk);
    }

    fn chunk(&self, chunk_id: ChunkId) -> Option<&Chunk> {
        self.sequence_by_id
            .get(&chunk_id)
            .and_then(|sequence| self.chunks.get(sequence))
    }

    fn document_chunks(&self, document_id: DocumentId) -> Vec<Chunk> {
        let mut chunks = self
            .chunks
            .values()
            .filter(|chunk| chunk.document_id == document_id)
            .cloned()
            .collect::<Vec<_>>();
        chunks.sort_by_key(|chunk| chunk.position);
        chunks
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimensions: usize,
    documents: Vec<Document>,
    chunks: Vec<Chunk>,
}

impl MemoryStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Whether any remaining document, of any owner, points at `storage_ref`.
    pub async fn references_storage(&self, storage_ref: &str) -> bool {
        let state = self.state.read().await;
        state
            .documents
            .values()
            .any(|document| document.storage_ref == storage_ref)
    }

    pub async fn save_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let snapshot = {
            let state = self.state.read().await;
            let mut documents = state.documents.values().cloned().collect::<Vec<_>>();
            documents.sort_by_key(|document| (document.uploaded_at, document.id));
            Snapshot {
                dimensions: self.dimensions,
                documents,
                chunks: state.chunks.values().cloned().collect(),
            }
        };

        let encoded = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, encoded).await?;
        tokio::fs::rename(&staging, path).await?;

        debug!(
            path = %path.display(),
            documents = snapshot.documents.len(),
            chunks = snapshot.chunks.len(),
            "store snapshot written"
        );
        Ok(())
    }

    pub async fn load_snapshot(path: &Path) -> Result<Self, StoreError> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;

        let mut state = StoreState::default();
        for document in snapshot.documents {
            state.documents.insert(document.id, document);
        }

        for chunk in snapshot.chunks {
            if chunk.embedding.is_some() != chunk.processed_at.is_some() {
                return Err(StoreError::InvalidRecord(format!(
                    "chunk {} has embedding and processed timestamp out of sync",
                    chunk.id
                )));
            }
            if let Some(vector) = &chunk.embedding {
                if vector.len() != snapshot.dimensions {
                    return Err(StoreError::DimensionMismatch {
                        expected: snapshot.dimensions,
                        actual: vector.len(),
                    });
                }
            }
            state.push_chunk(chunk);
        }

        Ok(Self {
            dimensions: snapshot.dimensions,
            state: RwLock::new(state),
        })
    }

    /// Loads the snapshot at `path` when it exists, otherwise starts empty.
    /// A snapshot written for another embedding dimension is refused.
    pub async fn open_or_create(path: &Path, dimensions: usize) -> Result<Self, StoreError> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self::new(dimensions));
        }

        let store = Self::load_snapshot(path).await?;
        if store.dimensions != dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: store.dimensions,
                actual: dimensions,
            });
        }
        Ok(store)
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), StoreError> {
        if vector.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_document(&self, document: NewDocument) -> Result<Document, StoreError> {
        let created = Document {
            id: DocumentId::new(),
            owner_id: document.owner_id,
            name: document.name,
            size_bytes: document.size_bytes,
            storage_ref: document.storage_ref,
            uploaded_at: Utc::now(),
            status: DocumentStatus::Uploaded,
        };

        let mut state = self.state.write().await;
        state.documents.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_document(&self, document_id: DocumentId) -> Result<Option<Document>, StoreError> {
        let state = self.state.read().await;
        Ok(state.documents.get(&document_id).cloned())
    }

    async fn list_documents(&self, owner_id: &OwnerId) -> Result<Vec<Document>, StoreError> {
        let state = self.state.read().await;
        let mut documents = state
            .documents
            .values()
            .filter(|document| &document.owner_id == owner_id)
            .cloned()
            .collect::<Vec<_>>();
        documents.sort_by_key(|document| (document.uploaded_at, document.id));
        Ok(documents)
    }

    async fn set_status(
        &self,
        document_id: DocumentId,
        status: DocumentStatus,
    ) -> Result<Document, StoreError> {
        let mut state = self.state.write().await;
        let document = state
            .documents
            .get_mut(&document_id)
            .ok_or(StoreError::DocumentNotFound(document_id))?;
        document.status = status;
        Ok(document.clone())
    }

    async fn delete_document(&self, document_id: DocumentId) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if state.documents.remove(&document_id).is_none() {
            return Ok(false);
        }

        let doomed = state
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.document_id == document_id)
            .map(|(sequence, chunk)| (*sequence, chunk.id))
            .collect::<Vec<_>>();

        for (sequence, chunk_id) in &doomed {
            state.chunks.remove(sequence);
            state.sequence_by_id.remove(chunk_id);
        }

        debug!(%document_id, chunks = doomed.len(), "document deleted");
        Ok(true)
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn insert_chunks(
        &self,
        document_id: DocumentId,
        owner_id: &OwnerId,
        records: &[ChunkRecord],
    ) -> Result<Vec<ChunkId>, StoreError> {
        let mut state = self.state.write().await;

        let document = state
            .documents
            .get(&document_id)
            .ok_or(StoreError::DocumentNotFound(document_id))?;
        if &document.owner_id != owner_id {
            return Err(StoreError::InvalidRecord(format!(
                "owner {owner_id} does not own document {document_id}"
            )));
        }

        let mut taken = state
            .chunks
            .values()
            .filter(|chunk| chunk.document_id == document_id)
            .map(|chunk| chunk.position)
            .collect::<HashSet<_>>();

        for record in records {
            if record.text.trim().is_empty() {
                return Err(StoreError::InvalidRecord(format!(
                    "chunk at position {} has empty text",
                    record.position
                )));
            }
            if record.page == 0 {
                return Err(StoreError::InvalidRecord(format!(
                    "chunk at position {} has page 0",
                    record.position
                )));
            }
            if !taken.insert(record.position) {
                return Err(StoreError::InvalidRecord(format!(
                    "position {} already exists for document {document_id}",
                    record.position
                )));
            }
        }

        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let chunk = Chunk {
                id: ChunkId::new(),
                document_id,
                owner_id: owner_id.clone(),
                text: record.text.clone(),
                page: record.page,
                position: record.position,
                embedding: None,
                processed_at: None,
            };
            ids.push(chunk.id);
            state.push_chunk(chunk);
        }

        Ok(ids)
    }

    async fn get_chunk(&self, chunk_id: ChunkId) -> Result<Option<Chunk>, StoreError> {
        let state = self.state.read().await;
        Ok(state.chunk(chunk_id).cloned())
    }

    async fn chunks_by_document(&self, document_id: DocumentId) -> Result<Vec<Chunk>, StoreError> {
        let state = self.state.read().await;
        Ok(state.document_chunks(document_id))
    }

    async fn get_unprocessed(&self, document_id: DocumentId) -> Result<Vec<Chunk>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .document_chunks(document_id)
            .into_iter()
            .filter(|chunk| !chunk.is_processed())
            .collect())
    }

    async fn set_embedding(&self, chunk_id: ChunkId, vector: Vec<f32>) -> Result<(), StoreError> {
        self.check_dimensions(&vector)?;

        let mut state = self.state.write().await;
        let sequence = *state
            .sequence_by_id
            .get(&chunk_id)
            .ok_or(StoreError::ChunkNotFound(chunk_id))?;
        let chunk = state
            .chunks
            .get_mut(&sequence)
            .ok_or(StoreError::ChunkNotFound(chunk_id))?;

        chunk.embedding = Some(vector);
        chunk.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn vector_search(
        &self,
        owner_id: &OwnerId,
        query_vector: &[f32],
        limit: usize,
        document_filter: Option<DocumentId>,
    ) -> Result<Vec<VectorMatch>, StoreError> {
        self.check_dimensions(query_vector)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let mut matches = state
            .chunks
            .values()
            .filter(|chunk| &chunk.owner_id == owner_id)
            .filter(|chunk| document_filter.map_or(true, |id| chunk.document_id == id))
            .filter_map(|chunk| {
                chunk.embedding.as_ref().map(|embedding| VectorMatch {
                    chunk_id: chunk.id,
                    score: cosine_similarity(query_vector, embedding),
                })
            })
            .collect::<Vec<_>>();

        matches.sort_by(|left, right| right.score.total_cmp(&left.score));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn get_context(
        &self,
        chunk_id: ChunkId,
        page_window: u32,
    ) -> Result<Vec<Chunk>, StoreError> {
        let state = self.state.read().await;
        let anchor = state
            .chunk(chunk_id)
            .ok_or(StoreError::ChunkNotFound(chunk_id))?;

        let lowest = anchor.page.saturating_sub(page_window);
        let highest = anchor.page.saturating_add(page_window);

        Ok(state
            .document_chunks(anchor.document_id)
            .into_iter()
            .filter(|chunk| (lowest..=highest).contains(&chunk.page))
            .collect())
    }
}
