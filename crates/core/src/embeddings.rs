use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;
pub const LOCAL_EMBEDDING_MODEL: &str = "local/char-trigram";
pub const DEFAULT_REMOTE_MODEL: &str = "togethercomputer/m2-bert-80M-8k-retrieval";
pub const DEFAULT_REMOTE_DIMENSIONS: usize = 768;
pub const DEFAULT_BASE_URL: &str = "https://api.together.xyz/v1";

/// Turns texts into fixed-dimension vectors, one per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        if vectors.len() != 1 {
            return Err(EmbeddingError::Rejected(format!(
                "expected 1 embedding, provider returned {}",
                vectors.len()
            )));
        }
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Rejected("provider returned no embedding".to_string()))
    }
}

fn reject_blank(texts: &[String]) -> Result<(), EmbeddingError> {
    match texts.iter().position(|text| text.trim().is_empty()) {
        Some(index) => Err(EmbeddingError::Rejected(format!(
            "input {index} is empty"
        ))),
        None => Ok(()),
    }
}

/// Deterministic, offline embedder based on hashed character trigrams.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model(&self) -> &str {
        LOCAL_EMBEDDING_MODEL
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        reject_blank(texts)?;
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    pub timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_REMOTE_MODEL.to_string(),
            dimensions: DEFAULT_REMOTE_DIMENSIONS,
            batch_size: 32,
            timeout: Duration::from_secs(30),
        }
    }
}

impl EmbeddingConfig {
    /// Reads `EMBEDDING_API_KEY`, `EMBEDDING_BASE_URL`, `EMBEDDING_MODEL`,
    /// `EMBEDDING_DIMENSIONS` and `EMBEDDING_BATCH_SIZE`, falling back to
    /// defaults for anything unset or blank.
    pub fn from_env() -> Result<Self, EmbeddingError> {
        let mut config = Self::default();

        config.api_key = non_blank_env("EMBEDDING_API_KEY");
        if let Some(base_url) = non_blank_env("EMBEDDING_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(model) = non_blank_env("EMBEDDING_MODEL") {
            config.model = model;
        }
        if let Some(raw) = non_blank_env("EMBEDDING_DIMENSIONS") {
            config.dimensions = raw.parse().map_err(|_| {
                EmbeddingError::Config(format!("EMBEDDING_DIMENSIONS is not a number: {raw}"))
            })?;
        }
        if let Some(raw) = non_blank_env("EMBEDDING_BATCH_SIZE") {
            config.batch_size = raw.parse().map_err(|_| {
                EmbeddingError::Config(format!("EMBEDDING_BATCH_SIZE is not a number: {raw}"))
            })?;
        }

        Ok(config)
    }
}

fn non_blank_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let value = value.trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

/// Client for OpenAI-compatible `/embeddings` endpoints.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: Client,
    endpoint: Url,
    model: String,
    dimensions: usize,
    batch_size: usize,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self, EmbeddingError> {
        if config.model.trim().is_empty() {
            return Err(EmbeddingError::Config("model name is empty".to_string()));
        }
        if config.dimensions == 0 {
            return Err(EmbeddingError::Config("dimensions must be positive".to_string()));
        }
        if config.batch_size == 0 {
            return Err(EmbeddingError::Config("batch_size must be positive".to_string()));
        }

        let base = Url::parse(&format!("{}/", config.base_url.trim_end_matches('/')))?;
        let endpoint = base.join("embeddings")?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = config.api_key.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
                .map_err(|_| EmbeddingError::Config("api key is not a valid header".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|error| EmbeddingError::Config(error.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            model: config.model,
            dimensions: config.dimensions,
            batch_size: config.batch_size,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, &body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| EmbeddingError::Rejected(format!("malformed response: {error}")))?;

        into_ordered_vectors(parsed, inputs.len(), self.dimensions)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        reject_blank(texts)?;

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            debug!(model = %self.model, batch = batch.len(), "requesting embeddings");
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

fn classify_status(status: StatusCode, body: &str) -> EmbeddingError {
    let details = format!("{status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        EmbeddingError::Unavailable(details)
    } else {
        EmbeddingError::Rejected(details)
    }
}

fn into_ordered_vectors(
    mut response: EmbeddingResponse,
    expected: usize,
    dimensions: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    response.data.sort_by_key(|entry| entry.index);

    if response.data.len() != expected {
        return Err(EmbeddingError::Rejected(format!(
            "provider returned {} embeddings for {} inputs",
            response.data.len(),
            expected
        )));
    }

    response
        .data
        .into_iter()
        .enumerate()
        .map(|(slot, entry)| {
            if entry.index != slot {
                return Err(EmbeddingError::Rejected(format!(
                    "missing embedding for input {slot}"
                )));
            }
            if entry.embedding.len() != dimensions {
                return Err(EmbeddingError::Rejected(format!(
                    "embedding dimension {} != {}",
                    entry.embedding.len(),
                    dimensions
                )));
            }
            Ok(entry.embedding)
        })
        .collect()
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
