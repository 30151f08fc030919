use crate::embeddings::Embedder;
use crate::error::{SearchError, StoreError};
use crate::models::{SearchHit, SearchQuery};
use crate::store::{ChunkStore, DocumentStore};
use std::sync::Arc;
use tracing::debug;

pub struct Retriever<E, S>
where
    E: Embedder + ?Sized,
    S: ChunkStore + DocumentStore + ?Sized,
{
    embedder: Arc<E>,
    store: Arc<S>,
}

impl<E, S> Retriever<E, S>
where
    E: Embedder + ?Sized,
    S: ChunkStore + DocumentStore + ?Sized,
{
    pub fn new(embedder: Arc<E>, store: Arc<S>) -> Self {
        Self { embedder, store }
    }

    /// Ranked, owner-scoped hits for `query`. Chunks or documents that
    /// disappeared between indexing and reading are skipped.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, SearchError> {
        if query.text.trim().is_empty() {
            return Err(SearchError::InvalidInput("query is empty".to_string()));
        }
        if query.limit == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed_one(&query.text).await?;
        if query_vector.is_empty() {
            return Err(SearchError::EmptyEmbedding);
        }

        let matches = self
            .store
            .vector_search(
                &query.owner_id,
                &query_vector,
                query.limit,
                query.document_id,
            )
            .await?;

        let mut hits = Vec::with_capacity(matches.len());
        for found in matches {
            let Some(chunk) = self.store.get_chunk(found.chunk_id).await? else {
                debug!(chunk_id = %found.chunk_id, "skipping stale chunk reference");
                continue;
            };
            if chunk.owner_id != query.owner_id {
                continue;
            }

            let Some(document) = self.store.get_document(chunk.document_id).await? else {
                debug!(document_id = %chunk.document_id, "skipping chunk of deleted document");
                continue;
            };

            let context = if query.include_context {
                match self.store.get_context(chunk.id, query.page_window).await {
                    Ok(context) => context,
                    Err(StoreError::ChunkNotFound(_)) => continue,
                    Err(error) => return Err(error.into()),
                }
            } else {
                Vec::new()
            };

            hits.push(SearchHit {
                chunk,
                document,
                context,
                score: found.score,
            });
        }

        debug!(
            owner_id = %query.owner_id,
            requested = query.limit,
            returned = hits.len(),
            "search finished"
        );
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{
        Chunk, ChunkId, ChunkRecord, Document, DocumentId, DocumentStatus, NewDocument, OwnerId,
        VectorMatch,
    };
    use crate::stores::MemoryStore;
    use async_trait::async_trait;

    const DIMENSIONS: usize = 64;

    /// Wraps a real store and injects matches that point at nothing.
    struct GhostStore {
        inner: MemoryStore,
        ghost: ChunkId,
    }

    #[async_trait]
    impl DocumentStore for GhostStore {
        async fn create_document(&self, document: NewDocument) -> Result<Document, StoreError> {
            self.inner.create_document(document).await
        }

        async fn get_document(
            &self,
            document_id: DocumentId,
        ) -> Result<Option<Document>, StoreError> {
            self.inner.get_document(document_id).await
        }

        async fn list_documents(&self, owner_id: &OwnerId) -> Result<Vec<Document>, StoreError> {
            self.inner.list_documents(owner_id).await
        }

        async fn set_status(
            &self,
            document_id: DocumentId,
            status: DocumentStatus,
        ) -> Result<Document, StoreError> {
            self.inner.set_status(document_id, status).await
        }

        async fn delete_document(&self, document_id: DocumentId) -> Result<bool, StoreError> {
            self.inner.delete_document(document_id).await
        }
    }

    #[async_trait]
    impl ChunkStore for GhostStore {
        async fn insert_chunks(
            &self,
            document_id: DocumentId,
            owner_id: &OwnerId,
            records: &[ChunkRecord],
        ) -> Result<Vec<ChunkId>, StoreError> {
            self.inner.insert_chunks(document_id, owner_id, records).await
        }

        async fn get_chunk(&self, chunk_id: ChunkId) -> Result<Option<Chunk>, StoreError> {
            self.inner.get_chunk(chunk_id).await
        }

        async fn chunks_by_document(
            &self,
            document_id: DocumentId,
        ) -> Result<Vec<Chunk>, StoreError> {
            self.inner.chunks_by_document(document_id).await
        }

        async fn get_unprocessed(&self, document_id: DocumentId) -> Result<Vec<Chunk>, StoreError> {
            self.inner.get_unprocessed(document_id).await
        }

        async fn set_embedding(&self, chunk_id: ChunkId, vector: Vec<f32>) -> Result<(), StoreError> {
            self.inner.set_embedding(chunk_id, vector).await
        }

        async fn vector_search(
            &self,
            owner_id: &OwnerId,
            query_vector: &[f32],
            limit: usize,
            document_filter: Option<DocumentId>,
        ) -> Result<Vec<VectorMatch>, StoreError> {
            let mut matches = vec![VectorMatch {
                chunk_id: self.ghost,
                score: 1.0,
            }];
            matches.extend(
                self.inner
                    .vector_search(owner_id, query_vector, limit, document_filter)
                    .await?,
            );
            Ok(matches)
        }

        async fn get_context(
            &self,
            chunk_id: ChunkId,
            page_window: u32,
        ) -> Result<Vec<Chunk>, StoreError> {
            self.inner.get_context(chunk_id, page_window).await
        }
    }

    async fn seed<S>(store: &S, owner: &str, pages: &[&str]) -> Document
    where
        S: ChunkStore + DocumentStore,
    {
        let embedder = CharacterNgramEmbedder {
            dimensions: DIMENSIONS,
        };
        let document = store
            .create_document(NewDocument {
                owner_id: OwnerId::new(owner),
                name: format!("{owner}.pdf"),
                size_bytes: 1,
                storage_ref: "blob".to_string(),
            })
            .await
            .expect("document");

        let records = pages
            .iter()
            .enumerate()
            .map(|(index, text)| ChunkRecord {
                text: text.to_string(),
                page: index as u32 + 1,
                position: index as u64,
            })
            .collect::<Vec<_>>();
        let ids = store
            .insert_chunks(document.id, &document.owner_id, &records)
            .await
            .expect("insert");
        for (id, record) in ids.iter().zip(records.iter()) {
            store
                .set_embedding(*id, embedder.embed_text(&record.text))
                .await
                .expect("embed");
        }
        document
    }

    fn retriever<S>(store: Arc<S>) -> Retriever<CharacterNgramEmbedder, S>
    where
        S: ChunkStore + DocumentStore,
    {
        Retriever::new(
            Arc::new(CharacterNgramEmbedder {
                dimensions: DIMENSIONS,
            }),
            store,
        )
    }

    #[tokio::test]
    async fn blank_query_is_invalid_input() {
        let retriever = retriever(Arc::new(MemoryStore::new(DIMENSIONS)));
        let result = retriever
            .search(&SearchQuery::new("   ", OwnerId::new("a")))
            .await;
        assert!(matches!(result, Err(SearchError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn hits_are_owner_scoped_and_carry_store_scores() {
        let store = Arc::new(MemoryStore::new(DIMENSIONS));
        let mine = seed(
            store.as_ref(),
            "user-a",
            &["hydraulic pump maintenance", "valve torque table"],
        )
        .await;
        seed(store.as_ref(), "user-b", &["hydraulic pump maintenance"]).await;

        let query = SearchQuery::new("hydraulic pump maintenance", mine.owner_id.clone())
            .with_limit(10);
        let hits = retriever(Arc::clone(&store))
            .search(&query)
            .await
            .expect("search");

        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|hit| hit.chunk.owner_id == mine.owner_id));
        assert!(hits.iter().all(|hit| hit.document.id == mine.id));
        assert_eq!(hits[0].chunk.text, "hydraulic pump maintenance");
        assert!(hits[0].score >= hits[1].score);
        assert!(hits.iter().all(|hit| hit.context.is_empty()));

        let embedder = CharacterNgramEmbedder {
            dimensions: DIMENSIONS,
        };
        let raw = store
            .vector_search(
                &mine.owner_id,
                &embedder.embed_text("hydraulic pump maintenance"),
                10,
                None,
            )
            .await
            .expect("raw search");
        assert_eq!(hits[0].score, raw[0].score);
    }

    #[tokio::test]
    async fn context_is_loaded_on_request() {
        let store = Arc::new(MemoryStore::new(DIMENSIONS));
        let document = seed(
            store.as_ref(),
            "user-a",
            &["intro page", "pressure limits for pumps", "appendix", "index"],
        )
        .await;

        let query = SearchQuery::new("pressure limits for pumps", document.owner_id.clone())
            .with_limit(1)
            .in_document(document.id)
            .with_context(true);
        let hits = retriever(store).search(&query).await.expect("search");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.page, 2);
        let pages = hits[0]
            .context
            .iter()
            .map(|chunk| chunk.page)
            .collect::<Vec<_>>();
        assert_eq!(pages, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stale_references_are_dropped() {
        let store = Arc::new(GhostStore {
            inner: MemoryStore::new(DIMENSIONS),
            ghost: ChunkId::new(),
        });
        let document = seed(store.as_ref(), "user-a", &["surviving chunk"]).await;

        let query = SearchQuery::new("surviving chunk", document.owner_id.clone())
            .with_context(true);
        let hits = retriever(Arc::clone(&store))
            .search(&query)
            .await
            .expect("search tolerates stale ids");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.text, "surviving chunk");
    }

    #[tokio::test]
    async fn zero_limit_returns_nothing() {
        let store = Arc::new(MemoryStore::new(DIMENSIONS));
        let document = seed(store.as_ref(), "user-a", &["anything"]).await;

        let query = SearchQuery::new("anything", document.owner_id.clone()).with_limit(0);
        let hits = retriever(store).search(&query).await.expect("search");
        assert!(hits.is_empty());
    }
}
