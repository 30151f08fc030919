use anyhow::{anyhow, Context as _};
use chrono::Utc;
use clap::{Parser, Subcommand};
use docchat_retrieval_core::{
    discover_pdf_files, parse_task_proposal, BlobStore, CharacterNgramEmbedder, ChunkStore,
    DocumentId, DocumentStatus, DocumentStore, Embedder, EmbeddingConfig, HttpEmbedder,
    IngestionOptions, IngestionReport, Ingestor, LocalBlobStore, LopdfExtractor, MemoryStore,
    NewDocument, OwnerId, Retriever, SearchQuery,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SNAPSHOT_FILE: &str = "store.json";
const BLOB_DIR: &str = "blobs";

type AppIngestor = Ingestor<LopdfExtractor, dyn Embedder, MemoryStore>;

#[derive(Parser)]
#[command(name = "docchat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the store snapshot and uploaded PDFs.
    #[arg(long, env = "DOCCHAT_STATE_DIR", default_value = ".docchat", global = true)]
    state_dir: PathBuf,

    /// Embed with the offline character-trigram model instead of the HTTP provider.
    #[arg(long, env = "DOCCHAT_LOCAL_EMBEDDER", default_value_t = false, global = true)]
    local_embedder: bool,

    /// OpenAI-compatible embeddings base URL.
    #[arg(long, env = "EMBEDDING_BASE_URL", global = true)]
    embedding_url: Option<String>,

    /// Embedding model name.
    #[arg(long, env = "EMBEDDING_MODEL", global = true)]
    embedding_model: Option<String>,

    /// Vector length produced by the embedding model.
    #[arg(long, env = "EMBEDDING_DIMENSIONS", global = true)]
    embedding_dimensions: Option<usize>,

    /// Bearer token for the embeddings endpoint.
    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true, global = true)]
    embedding_api_key: Option<String>,

    #[arg(long, default_value = "1000", global = true)]
    chunk_size: usize,

    #[arg(long, default_value = "200", global = true)]
    chunk_overlap: usize,

    /// Extraction attempts before a PDF is given up on.
    #[arg(long, default_value = "3", global = true)]
    max_parse_attempts: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Store a PDF and register it as an uploaded document.
    Upload {
        path: PathBuf,
        #[arg(long, env = "DOCCHAT_OWNER")]
        owner: String,
    },
    /// Chunk and embed an uploaded document, resuming any earlier partial run.
    Ingest {
        document_id: DocumentId,
        /// Embedding passes before the document is marked failed.
        #[arg(long, default_value = "3")]
        max_passes: u32,
        /// Pause between embedding passes, in milliseconds.
        #[arg(long, default_value = "2000")]
        pass_delay_ms: u64,
    },
    /// Upload and ingest every PDF under a folder.
    IngestFolder {
        folder: PathBuf,
        #[arg(long, env = "DOCCHAT_OWNER")]
        owner: String,
        /// Documents ingested at the same time.
        #[arg(long, default_value = "4")]
        concurrency: usize,
        #[arg(long, default_value = "3")]
        max_passes: u32,
    },
    /// Semantic search over one owner's processed chunks.
    Search {
        query: String,
        #[arg(long, env = "DOCCHAT_OWNER")]
        owner: String,
        #[arg(long, default_value = "5")]
        limit: usize,
        /// Restrict hits to a single document.
        #[arg(long)]
        document: Option<DocumentId>,
        /// Print neighbouring chunks for each hit.
        #[arg(long, default_value_t = false)]
        context: bool,
        #[arg(long, default_value = "1")]
        page_window: u32,
    },
    /// List an owner's documents with their ingestion progress.
    Status {
        #[arg(long, env = "DOCCHAT_OWNER")]
        owner: String,
    },
    /// Delete a document, its chunks and, when unshared, its stored PDF.
    Delete { document_id: DocumentId },
    /// Read an assistant reply from a file or stdin and print its task proposal.
    ParseTask { path: Option<PathBuf> },
}

struct App {
    store: Arc<MemoryStore>,
    blobs: Arc<LocalBlobStore>,
    embedder: Arc<dyn Embedder>,
    options: IngestionOptions,
    snapshot_path: PathBuf,
}

impl App {
    async fn open(cli: &Cli) -> anyhow::Result<Self> {
        let embedder = build_embedder(cli)?;
        let snapshot_path = cli.state_dir.join(SNAPSHOT_FILE);
        let store = MemoryStore::open_or_create(&snapshot_path, embedder.dimensions())
            .await
            .with_context(|| format!("opening store at {}", snapshot_path.display()))?;
        let blobs = LocalBlobStore::open(cli.state_dir.join(BLOB_DIR)).await?;

        let options = IngestionOptions {
            chunk_size: cli.chunk_size,
            chunk_overlap: cli.chunk_overlap,
            max_parse_attempts: cli.max_parse_attempts,
            ..IngestionOptions::default()
        };

        info!(
            model = embedder.model(),
            dimensions = embedder.dimensions(),
            state_dir = %cli.state_dir.display(),
            "store opened"
        );

        Ok(Self {
            store: Arc::new(store),
            blobs: Arc::new(blobs),
            embedder,
            options,
            snapshot_path,
        })
    }

    fn ingestor(&self) -> anyhow::Result<AppIngestor> {
        Ok(Ingestor::new(
            LopdfExtractor,
            Arc::clone(&self.embedder),
            Arc::clone(&self.store),
            self.options.clone(),
        )?)
    }

    async fn save(&self) -> anyhow::Result<()> {
        self.store.save_snapshot(&self.snapshot_path).await?;
        Ok(())
    }
}

fn build_embedder(cli: &Cli) -> anyhow::Result<Arc<dyn Embedder>> {
    if cli.local_embedder {
        return Ok(Arc::new(CharacterNgramEmbedder::default()));
    }

    let mut config = EmbeddingConfig::from_env()?;
    if let Some(url) = &cli.embedding_url {
        config.base_url = url.clone();
    }
    if let Some(model) = &cli.embedding_model {
        config.model = model.clone();
    }
    if let Some(dimensions) = cli.embedding_dimensions {
        config.dimensions = dimensions;
    }
    if cli.embedding_api_key.is_some() {
        config.api_key = cli.embedding_api_key.clone();
    }

    Ok(Arc::new(HttpEmbedder::new(config)?))
}

async fn upload(
    store: &MemoryStore,
    blobs: &LocalBlobStore,
    path: &Path,
    owner: &OwnerId,
) -> anyhow::Result<DocumentId> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let storage_ref = blobs.put(&bytes).await?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let document = store
        .create_document(NewDocument {
            owner_id: owner.clone(),
            name,
            size_bytes: bytes.len() as u64,
            storage_ref,
        })
        .await?;
    info!(document_id = %document.id, owner_id = %owner, "document uploaded");
    Ok(document.id)
}

/// Runs ingestion, then further embedding passes while chunks remain
/// unembedded. Exhausting `max_passes` marks the document failed.
async fn ingest_with_budget(
    ingestor: &AppIngestor,
    store: &MemoryStore,
    blobs: &LocalBlobStore,
    document_id: DocumentId,
    max_passes: u32,
    pass_delay: Duration,
) -> anyhow::Result<IngestionReport> {
    let document = store
        .get_document(document_id)
        .await?
        .ok_or_else(|| anyhow!("document {document_id} not found"))?;
    let bytes = blobs.get(&document.storage_ref).await?;

    let mut report = ingestor.ingest(document_id, &bytes).await?;
    let mut passes = 1;
    while report.status != DocumentStatus::Processed && passes < max_passes.max(1) {
        warn!(
            %document_id,
            failed = report.failed,
            pass = passes,
            "chunks left unembedded, running another pass"
        );
        tokio::time::sleep(pass_delay).await;
        let next = ingestor.resume(document_id).await?;
        report.embedded += next.embedded;
        report.failed = next.failed;
        report.status = next.status;
        passes += 1;
    }

    if report.status != DocumentStatus::Processed {
        let failed = ingestor.mark_failed(document_id).await?;
        warn!(%document_id, passes, "embedding budget exhausted, document marked failed");
        report.status = failed.status;
    }
    Ok(report)
}

fn print_report(report: &IngestionReport) {
    println!(
        "document={} status={} chunks_inserted={} embedded={} failed={}",
        report.document_id, report.status, report.chunks_inserted, report.embedded, report.failed
    );
}

/// Outcome counts for `ingest-folder`. A task that panicked or was cancelled
/// counts as unfinished so the snapshot is still saved.
#[derive(Debug, Default)]
struct FolderTally {
    processed: usize,
    unfinished: usize,
}

impl FolderTally {
    fn record(&mut self, joined: Result<anyhow::Result<IngestionReport>, JoinError>) {
        match joined {
            Ok(Ok(report)) => {
                if report.status == DocumentStatus::Processed {
                    self.processed += 1;
                } else {
                    self.unfinished += 1;
                }
                print_report(&report);
            }
            Ok(Err(error)) => {
                self.unfinished += 1;
                warn!(error = %format!("{error:#}"), "document not ingested");
            }
            Err(error) => {
                self.unfinished += 1;
                warn!(error = %error, "ingestion task aborted");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "docchat boot"
    );

    if let Command::ParseTask { path } = &cli.command {
        let reply = match path {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
            None => {
                let mut buffer = String::new();
                std::io::stdin().read_to_string(&mut buffer)?;
                buffer
            }
        };
        match parse_task_proposal(&reply) {
            Some(proposal) => println!("{}", serde_json::to_string_pretty(&proposal)?),
            None => println!("no task proposal found"),
        }
        return Ok(());
    }

    let app = App::open(&cli).await?;

    match cli.command {
        Command::Upload { path, owner } => {
            let document_id = upload(&app.store, &app.blobs, &path, &OwnerId::new(owner)).await?;
            app.save().await?;
            println!("{document_id}");
        }
        Command::Ingest {
            document_id,
            max_passes,
            pass_delay_ms,
        } => {
            let ingestor = app.ingestor()?;
            let outcome = ingest_with_budget(
                &ingestor,
                &app.store,
                &app.blobs,
                document_id,
                max_passes,
                Duration::from_millis(pass_delay_ms),
            )
            .await;
            app.save().await?;
            print_report(&outcome?);
        }
        Command::IngestFolder {
            folder,
            owner,
            concurrency,
            max_passes,
        } => {
            let owner = OwnerId::new(owner);
            let files = discover_pdf_files(&folder);
            info!(folder = %folder.display(), files = files.len(), "ingesting folder");

            let ingestor = Arc::new(app.ingestor()?);
            let permits = Arc::new(Semaphore::new(concurrency.max(1)));
            let mut tasks = JoinSet::new();

            for path in files {
                let document_id = match upload(&app.store, &app.blobs, &path, &owner).await {
                    Ok(document_id) => document_id,
                    Err(error) => {
                        warn!(path = %path.display(), error = %error, "skipped pdf");
                        continue;
                    }
                };

                let ingestor = Arc::clone(&ingestor);
                let store = Arc::clone(&app.store);
                let blobs = Arc::clone(&app.blobs);
                let permits = Arc::clone(&permits);
                tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await?;
                    let report = ingest_with_budget(
                        &ingestor,
                        &store,
                        &blobs,
                        document_id,
                        max_passes,
                        Duration::from_secs(1),
                    )
                    .await
                    .with_context(|| format!("ingesting {}", path.display()))?;
                    anyhow::Ok(report)
                });
            }

            let mut tally = FolderTally::default();
            while let Some(joined) = tasks.join_next().await {
                tally.record(joined);
            }

            app.save().await?;
            println!(
                "{} document(s) processed, {} not processed",
                tally.processed, tally.unfinished
            );
        }
        Command::Search {
            query,
            owner,
            limit,
            document,
            context,
            page_window,
        } => {
            let retriever = Retriever::new(Arc::clone(&app.embedder), Arc::clone(&app.store));
            let mut search_query = SearchQuery::new(query, OwnerId::new(owner))
                .with_limit(limit)
                .with_context(context);
            search_query.page_window = page_window;
            if let Some(document_id) = document {
                search_query = search_query.in_document(document_id);
            }

            let hits = retriever.search(&search_query).await?;
            if hits.is_empty() {
                println!("no matches");
            }
            for (rank, hit) in hits.iter().enumerate() {
                println!(
                    "[{}] score={:.4} document={} ({}) page={} position={}",
                    rank + 1,
                    hit.score,
                    hit.document.id,
                    hit.document.name,
                    hit.chunk.page,
                    hit.chunk.position
                );
                println!("  {}", hit.chunk.text);
                for neighbour in hit.context.iter().filter(|chunk| chunk.id != hit.chunk.id) {
                    println!(
                        "  context page={} position={}: {}",
                        neighbour.page, neighbour.position, neighbour.text
                    );
                }
            }
        }
        Command::Status { owner } => {
            let documents = app.store.list_documents(&OwnerId::new(owner)).await?;
            if documents.is_empty() {
                println!("no documents");
            }
            for document in documents {
                let chunks = app.store.chunks_by_document(document.id).await?;
                let processed = chunks.iter().filter(|chunk| chunk.is_processed()).count();
                println!(
                    "{} status={} chunks={}/{} uploaded_at={} name={}",
                    document.id,
                    document.status,
                    processed,
                    chunks.len(),
                    document.uploaded_at.to_rfc3339(),
                    document.name
                );
            }
        }
        Command::Delete { document_id } => {
            let Some(document) = app.store.get_document(document_id).await? else {
                println!("document {document_id} not found");
                return Ok(());
            };
            app.store.delete_document(document_id).await?;
            if !app.store.references_storage(&document.storage_ref).await {
                app.blobs.delete(&document.storage_ref).await?;
            }
            app.save().await?;
            println!("deleted {document_id}");
        }
        Command::ParseTask { .. } => {}
    }

    Ok(())
}
