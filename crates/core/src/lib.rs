pub mod blob;
pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod retrieval;
pub mod store;
pub mod stores;
pub mod task_proposal;

pub use blob::{digest_bytes, BlobStore, LocalBlobStore};
pub use chunking::{chunk_pages, split_text, ChunkingConfig};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, EmbeddingConfig, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EmbeddingError, IngestError, SearchError, StoreError};
pub use extractor::{extract_with_retry, LopdfExtractor, PageText, PdfExtractor};
pub use ingest::{discover_pdf_files, Ingestor};
pub use models::{
    Chunk, ChunkId, ChunkRecord, Document, DocumentId, DocumentStatus, IngestionOptions,
    IngestionReport, NewDocument, OwnerId, SearchHit, SearchQuery, VectorMatch,
};
pub use retrieval::Retriever;
pub use store::{cosine_similarity, ChunkStore, DocumentStore};
pub use stores::MemoryStore;
pub use task_proposal::{parse_task_proposal, TaskPriority, TaskProposal};
