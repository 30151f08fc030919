use crate::chunking::{chunk_pages, ChunkingConfig};
use crate::embeddings::Embedder;
use crate::error::IngestError;
use crate::extractor::{extract_with_retry, PdfExtractor};
use crate::models::{Chunk, Document, DocumentId, DocumentStatus, IngestionOptions, IngestionReport};
use crate::store::{ChunkStore, DocumentStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug, Default, Clone, Copy)]
struct PassOutcome {
    embedded: usize,
    failed: usize,
}

/// Drives a document from `uploaded` to `processed`.
///
/// Every decision is re-derived from store state (whether chunks exist,
/// which chunks are still unprocessed), so an interrupted run can simply be
/// invoked again.
pub struct Ingestor<X, E, S>
where
    X: PdfExtractor,
    E: Embedder + ?Sized,
    S: ChunkStore + DocumentStore + ?Sized,
{
    extractor: X,
    embedder: Arc<E>,
    store: Arc<S>,
    options: IngestionOptions,
    chunking: ChunkingConfig,
}

impl<X, E, S> Ingestor<X, E, S>
where
    X: PdfExtractor,
    E: Embedder + ?Sized,
    S: ChunkStore + DocumentStore + ?Sized,
{
    pub fn new(
        extractor: X,
        embedder: Arc<E>,
        store: Arc<S>,
        options: IngestionOptions,
    ) -> Result<Self, IngestError> {
        let chunking = ChunkingConfig::try_from(&options)?;
        Ok(Self {
            extractor,
            embedder,
            store,
            options,
            chunking,
        })
    }

    /// Extracts, chunks and inserts the document when it has no chunks yet,
    /// then embeds whatever is still unprocessed. `pdf_bytes` is ignored once
    /// chunks exist.
    pub async fn ingest(
        &self,
        document_id: DocumentId,
        pdf_bytes: &[u8],
    ) -> Result<IngestionReport, IngestError> {
        let document = self.load_document(document_id).await?;
        self.ensure_not_failed(&document)?;

        let mut chunks_inserted = 0;
        let existing = self.store.chunks_by_document(document_id).await?;
        if existing.is_empty() && document.status != DocumentStatus::Processed {
            chunks_inserted = self.insert_chunks(&document, pdf_bytes).await?;
        }

        if document.status == DocumentStatus::Uploaded {
            self.transition(document_id, DocumentStatus::Processing).await?;
        }

        self.embed_until_settled(document_id, chunks_inserted).await
    }

    /// Continues embedding for a document whose chunks are already stored.
    pub async fn resume(&self, document_id: DocumentId) -> Result<IngestionReport, IngestError> {
        let document = self.load_document(document_id).await?;
        self.ensure_not_failed(&document)?;

        if document.status == DocumentStatus::Uploaded {
            let existing = self.store.chunks_by_document(document_id).await?;
            if existing.is_empty() {
                return Err(IngestError::InvalidInput(format!(
                    "document {document_id} has not been chunked yet"
                )));
            }
            self.transition(document_id, DocumentStatus::Processing).await?;
        }

        self.embed_until_settled(document_id, 0).await
    }

    /// Forces a `processing` document to `failed` once the caller's own
    /// retry budget is spent.
    pub async fn mark_failed(&self, document_id: DocumentId) -> Result<Document, IngestError> {
        self.transition(document_id, DocumentStatus::Failed).await?;
        self.load_document(document_id).await
    }

    async fn insert_chunks(&self, document: &Document, pdf_bytes: &[u8]) -> Result<usize, IngestError> {
        let pages = extract_with_retry(
            &self.extractor,
            pdf_bytes,
            self.options.max_parse_attempts,
            self.options.retry_base_delay,
        )
        .await?;

        let records = chunk_pages(&pages, self.chunking);
        if records.is_empty() {
            return Err(IngestError::InvalidInput(format!(
                "document {} has no extractable text in {} page(s)",
                document.id,
                pages.len()
            )));
        }

        let ids = self
            .store
            .insert_chunks(document.id, &document.owner_id, &records)
            .await?;

        info!(
            document_id = %document.id,
            pages = pages.len(),
            chunks = ids.len(),
            "document chunked"
        );
        Ok(ids.len())
    }

    async fn embed_until_settled(
        &self,
        document_id: DocumentId,
        chunks_inserted: usize,
    ) -> Result<IngestionReport, IngestError> {
        let mut embedded = 0;

        loop {
            let pending = self.store.get_unprocessed(document_id).await?;
            if pending.is_empty() {
                let status = self.transition(document_id, DocumentStatus::Processed).await?;
                return Ok(IngestionReport {
                    document_id,
                    chunks_inserted,
                    embedded,
                    failed: 0,
                    status,
                });
            }

            debug!(%document_id, pending = pending.len(), "embedding pass started");
            let outcome = self.embed_chunks(&pending).await;
            embedded += outcome.embedded;

            if outcome.failed > 0 {
                warn!(
                    %document_id,
                    embedded = outcome.embedded,
                    failed = outcome.failed,
                    "embedding pass incomplete, document stays in processing"
                );
                return Ok(IngestionReport {
                    document_id,
                    chunks_inserted,
                    embedded,
                    failed: outcome.failed,
                    status: DocumentStatus::Processing,
                });
            }
        }
    }

    async fn embed_chunks(&self, pending: &[Chunk]) -> PassOutcome {
        let mut outcome = PassOutcome::default();

        for chunk in pending {
            debug_assert!(
                !chunk.text.trim().is_empty(),
                "chunk {} has blank text",
                chunk.id
            );

            let vector = match self.embedder.embed_one(&chunk.text).await {
                Ok(vector) => vector,
                Err(error) => {
                    warn!(
                        chunk_id = %chunk.id,
                        position = chunk.position,
                        transient = error.is_transient(),
                        error = %error,
                        "chunk embedding failed"
                    );
                    outcome.failed += 1;
                    continue;
                }
            };

            match self.store.set_embedding(chunk.id, vector).await {
                Ok(()) => outcome.embedded += 1,
                Err(error) => {
                    warn!(
                        chunk_id = %chunk.id,
                        position = chunk.position,
                        error = %error,
                        "storing chunk embedding failed"
                    );
                    outcome.failed += 1;
                }
            }
        }

        outcome
    }

    async fn load_document(&self, document_id: DocumentId) -> Result<Document, IngestError> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or(IngestError::DocumentNotFound(document_id))
    }

    fn ensure_not_failed(&self, document: &Document) -> Result<(), IngestError> {
        if document.status == DocumentStatus::Failed {
            return Err(IngestError::InvalidTransition {
                document_id: document.id,
                from: DocumentStatus::Failed,
                to: DocumentStatus::Processing,
            });
        }
        Ok(())
    }

    async fn transition(
        &self,
        document_id: DocumentId,
        next: DocumentStatus,
    ) -> Result<DocumentStatus, IngestError> {
        let document = self.load_document(document_id).await?;
        if document.status == next {
            return Ok(next);
        }
        if !document.status.can_transition_to(next) {
            return Err(IngestError::InvalidTransition {
                document_id,
                from: document.status,
                to: next,
            });
        }

        self.store.set_status(document_id, next).await?;
        info!(%document_id, from = %document.status, to = %next, "document status changed");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::EmbeddingError;
    use crate::extractor::PageText;
    use crate::models::{ChunkRecord, NewDocument, OwnerId};
    use crate::stores::MemoryStore;
    use async_trait::async_trait;
    use std::fs::{self, File};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    struct StaticExtractor {
        pages: Vec<PageText>,
        calls: AtomicUsize,
    }

    impl StaticExtractor {
        fn new(texts: &[&str]) -> Self {
            Self {
                pages: texts
                    .iter()
                    .enumerate()
                    .map(|(index, text)| PageText {
                        number: index as u32 + 1,
                        text: text.to_string(),
                    })
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PdfExtractor for StaticExtractor {
        fn extract_pages(&self, _bytes: &[u8]) -> Result<Vec<PageText>, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.pages.clone())
        }
    }

    struct BrokenExtractor;

    impl PdfExtractor for BrokenExtractor {
        fn extract_pages(&self, _bytes: &[u8]) -> Result<Vec<PageText>, IngestError> {
            Err(IngestError::PdfParse("xref table is corrupt".to_string()))
        }
    }

    /// Fails for any text containing `poison`.
    struct PoisonedEmbedder {
        inner: CharacterNgramEmbedder,
        calls: AtomicUsize,
    }

    impl PoisonedEmbedder {
        fn new() -> Self {
            Self {
                inner: CharacterNgramEmbedder { dimensions: 16 },
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for PoisonedEmbedder {
        fn model(&self) -> &str {
            "test/poisoned"
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(texts.len(), Ordering::SeqCst);
            if texts.iter().any(|text| text.contains("poison")) {
                return Err(EmbeddingError::Unavailable("rate limited".to_string()));
            }
            self.inner.embed(texts).await
        }
    }

    fn options() -> IngestionOptions {
        IngestionOptions {
            retry_base_delay: Duration::from_millis(1),
            ..IngestionOptions::default()
        }
    }

    async fn uploaded(store: &MemoryStore) -> Document {
        store
            .create_document(NewDocument {
                owner_id: OwnerId::new("user-a"),
                name: "manual.pdf".to_string(),
                size_bytes: 2_048,
                storage_ref: "blob-1".to_string(),
            })
            .await
            .expect("document is created")
    }

    #[tokio::test]
    async fn failing_chunk_does_not_block_siblings() {
        let store = Arc::new(MemoryStore::new(16));
        let document = uploaded(&store).await;
        let extractor = StaticExtractor::new(&[
            "first chunk about pumps",
            "second chunk with poison inside",
            "third chunk about valves",
        ]);
        let ingestor = Ingestor::new(
            extractor,
            Arc::new(PoisonedEmbedder::new()),
            Arc::clone(&store),
            options(),
        )
        .expect("valid options");

        let report = ingestor
            .ingest(document.id, b"%PDF-1.4")
            .await
            .expect("ingestion runs");

        assert_eq!(report.chunks_inserted, 3);
        assert_eq!(report.embedded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.status, DocumentStatus::Processing);

        let chunks = store.chunks_by_document(document.id).await.expect("chunks");
        assert!(chunks[0].embedding.is_some() && chunks[0].processed_at.is_some());
        assert!(chunks[1].embedding.is_none() && chunks[1].processed_at.is_none());
        assert!(chunks[2].embedding.is_some() && chunks[2].processed_at.is_some());

        let stored = store.get_document(document.id).await.expect("lookup");
        assert_eq!(stored.map(|doc| doc.status), Some(DocumentStatus::Processing));
    }

    #[tokio::test]
    async fn later_run_finishes_remaining_chunks() {
        let store = Arc::new(MemoryStore::new(16));
        let document = uploaded(&store).await;
        let flaky = Ingestor::new(
            StaticExtractor::new(&["healthy text", "poison text"]),
            Arc::new(PoisonedEmbedder::new()),
            Arc::clone(&store),
            options(),
        )
        .expect("valid options");
        flaky.ingest(document.id, b"%PDF-1.4").await.expect("first run");

        let healthy = Ingestor::new(
            StaticExtractor::new(&[]),
            Arc::new(CharacterNgramEmbedder { dimensions: 16 }),
            Arc::clone(&store),
            options(),
        )
        .expect("valid options");
        let report = healthy.resume(document.id).await.expect("second run");

        assert_eq!(report.embedded, 1);
        assert_eq!(report.status, DocumentStatus::Processed);
        assert!(store
            .get_unprocessed(document.id)
            .await
            .expect("query")
            .is_empty());
    }

    #[tokio::test]
    async fn reingesting_a_processed_document_is_a_no_op() {
        let store = Arc::new(MemoryStore::new(16));
        let document = uploaded(&store).await;
        let embedder = Arc::new(PoisonedEmbedder::new());
        let ingestor = Ingestor::new(
            StaticExtractor::new(&["alpha text", "beta text"]),
            Arc::clone(&embedder),
            Arc::clone(&store),
            options(),
        )
        .expect("valid options");

        let first = ingestor.ingest(document.id, b"%PDF-1.4").await.expect("first run");
        assert_eq!(first.status, DocumentStatus::Processed);
        let before = store.chunks_by_document(document.id).await.expect("chunks");
        let calls_before = embedder.calls.load(Ordering::SeqCst);

        let second = ingestor.ingest(document.id, b"%PDF-1.4").await.expect("second run");

        assert_eq!(second.chunks_inserted, 0);
        assert_eq!(second.embedded, 0);
        assert_eq!(second.status, DocumentStatus::Processed);
        assert_eq!(store.chunks_by_document(document.id).await.expect("chunks"), before);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), calls_before);
        assert_eq!(ingestor.extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_document_fails_fast() {
        let store = Arc::new(MemoryStore::new(16));
        let ingestor = Ingestor::new(
            StaticExtractor::new(&["text"]),
            Arc::new(CharacterNgramEmbedder { dimensions: 16 }),
            store,
            options(),
        )
        .expect("valid options");

        let missing = DocumentId::new();
        let result = ingestor.ingest(missing, b"%PDF-1.4").await;

        assert!(matches!(result, Err(IngestError::DocumentNotFound(id)) if id == missing));
    }

    #[tokio::test]
    async fn exhausted_extraction_inserts_nothing() {
        let store = Arc::new(MemoryStore::new(16));
        let document = uploaded(&store).await;
        let ingestor = Ingestor::new(
            BrokenExtractor,
            Arc::new(CharacterNgramEmbedder { dimensions: 16 }),
            Arc::clone(&store),
            options(),
        )
        .expect("valid options");

        let result = ingestor.ingest(document.id, b"%PDF-1.4").await;

        assert!(matches!(result, Err(IngestError::RetryExhausted { attempts: 3, .. })));
        assert!(store
            .chunks_by_document(document.id)
            .await
            .expect("chunks")
            .is_empty());
        let stored = store.get_document(document.id).await.expect("lookup");
        assert_eq!(stored.map(|doc| doc.status), Some(DocumentStatus::Uploaded));
    }

    #[tokio::test]
    async fn pdf_without_text_is_invalid_input() {
        let store = Arc::new(MemoryStore::new(16));
        let document = uploaded(&store).await;
        let ingestor = Ingestor::new(
            StaticExtractor::new(&["", "   "]),
            Arc::new(CharacterNgramEmbedder { dimensions: 16 }),
            Arc::clone(&store),
            options(),
        )
        .expect("valid options");

        let result = ingestor.ingest(document.id, b"%PDF-1.4").await;
        assert!(matches!(result, Err(IngestError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn resume_recovers_chunks_left_in_uploaded_state() {
        let store = Arc::new(MemoryStore::new(16));
        let document = uploaded(&store).await;
        store
            .insert_chunks(
                document.id,
                &document.owner_id,
                &[ChunkRecord {
                    text: "inserted before a crash".to_string(),
                    page: 1,
                    position: 0,
                }],
            )
            .await
            .expect("insert");

        let ingestor = Ingestor::new(
            StaticExtractor::new(&["should not be read"]),
            Arc::new(CharacterNgramEmbedder { dimensions: 16 }),
            Arc::clone(&store),
            options(),
        )
        .expect("valid options");

        let report = ingestor.resume(document.id).await.expect("resume");

        assert_eq!(report.status, DocumentStatus::Processed);
        assert_eq!(ingestor.extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resume_without_chunks_is_rejected() {
        let store = Arc::new(MemoryStore::new(16));
        let document = uploaded(&store).await;
        let ingestor = Ingestor::new(
            StaticExtractor::new(&[]),
            Arc::new(CharacterNgramEmbedder { dimensions: 16 }),
            Arc::clone(&store),
            options(),
        )
        .expect("valid options");

        let result = ingestor.resume(document.id).await;
        assert!(matches!(result, Err(IngestError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn only_processing_documents_can_be_marked_failed() {
        let store = Arc::new(MemoryStore::new(16));
        let document = uploaded(&store).await;
        let ingestor = Ingestor::new(
            StaticExtractor::new(&["poison everywhere"]),
            Arc::new(PoisonedEmbedder::new()),
            Arc::clone(&store),
            options(),
        )
        .expect("valid options");

        let premature = ingestor.mark_failed(document.id).await;
        assert!(matches!(premature, Err(IngestError::InvalidTransition { .. })));

        ingestor.ingest(document.id, b"%PDF-1.4").await.expect("run");
        let failed = ingestor.mark_failed(document.id).await.expect("mark failed");
        assert_eq!(failed.status, DocumentStatus::Failed);

        let rerun = ingestor.ingest(document.id, b"%PDF-1.4").await;
        assert!(matches!(rerun, Err(IngestError::InvalidTransition { .. })));
    }

    #[test]
    fn invalid_chunking_options_are_rejected() {
        let result = Ingestor::new(
            StaticExtractor::new(&[]),
            Arc::new(CharacterNgramEmbedder::default()),
            Arc::new(MemoryStore::new(128)),
            IngestionOptions {
                chunk_size: 100,
                chunk_overlap: 100,
                ..IngestionOptions::default()
            },
        );
        assert!(matches!(result, Err(IngestError::InvalidChunkConfig(_))));
    }

    #[test]
    fn discover_pdf_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("b.PDF"))
            .and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(base.join("notes.txt")).and_then(|mut file| file.write_all(b"skip"))?;

        let files = discover_pdf_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }
}
