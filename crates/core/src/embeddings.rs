use crate::error::ModelError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;

const OPENAI_BATCH_SIZE: usize = 64;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Maps text to fixed-length vectors. Batching must not change per-text output.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    fn model_name(&self) -> &str;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| ModelError::InvalidResponse {
            backend: self.model_name().to_string(),
            details: "no embedding returned".to_string(),
        })
    }
}

/// Offline embedder hashing character trigrams into buckets.
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
    pub fn encode(&self, text: &str) -> Vec<f32> {
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
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    fn model_name(&self) -> &str {
        "char-trigram-hash"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Ok(texts.iter().map(|text| self.encode(text)).collect())
    }
}

/// Embeddings through an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

#[derive(Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingEntry>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingEntry {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, ModelError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
        })
    }

    async fn embed_chunk(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.trim())
            .json(&OpenAiEmbeddingRequest {
                model: &self.model,
                input: inputs,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ModelError::Status {
                backend: "openai".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let mut parsed: OpenAiEmbeddingResponse = response.json().await?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != inputs.len() {
            return Err(ModelError::InvalidResponse {
                backend: "openai".to_string(),
                details: format!(
                    "returned {} embeddings for {} inputs",
                    parsed.data.len(),
                    inputs.len()
                ),
            });
        }

        parsed
            .data
            .into_iter()
            .map(|entry| check_dimensions("openai", entry.embedding, self.dimensions))
            .collect()
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(OPENAI_BATCH_SIZE) {
            debug!(model = %self.model, batch = batch.len(), "requesting openai embeddings");
            vectors.extend(self.embed_chunk(batch).await?);
        }
        Ok(vectors)
    }
}

/// Embeddings from a local Ollama runtime.
pub struct OllamaEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: usize,
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: impl Into<String>, dimensions: usize) -> Result<Self, ModelError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/embed", base_url.trim_end_matches('/')),
            model: model.into(),
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(model = %self.model, batch = texts.len(), "requesting ollama embeddings");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&OllamaEmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ModelError::Status {
                backend: "ollama".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaEmbedResponse = response.json().await?;
        if parsed.embeddings.len() != texts.len() {
            return Err(ModelError::InvalidResponse {
                backend: "ollama".to_string(),
                details: format!(
                    "returned {} embeddings for {} inputs",
                    parsed.embeddings.len(),
                    texts.len()
                ),
            });
        }

        parsed
            .embeddings
            .into_iter()
            .map(|embedding| check_dimensions("ollama", embedding, self.dimensions))
            .collect()
    }
}

fn check_dimensions(
    backend: &str,
    embedding: Vec<f32>,
    expected: usize,
) -> Result<Vec<f32>, ModelError> {
    if embedding.len() != expected {
        return Err(ModelError::InvalidResponse {
            backend: backend.to_string(),
            details: format!(
                "embedding has {} dimensions, expected {expected}",
                embedding.len()
            ),
        });
    }
    Ok(embedding)
}
