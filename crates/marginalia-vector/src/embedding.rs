//! Embedding service trait and implementations.
//!
//! - `HttpEmbeddingService` calls an OpenAI-compatible API: `/embeddings`
//!   for text and `/chat/completions` with a vision model to turn images
//!   into text. This is the production backend.
//! - `MockEmbedding` provides deterministic hash-based vectors for testing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use marginalia_core::config::EmbeddingConfig;
use marginalia_core::error::MarginaliaError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Service for generating text embeddings.
///
/// Implementations convert text into fixed-dimensional vectors that capture
/// semantic meaning. Used for both ingestion (indexing) and search (query).
pub trait EmbeddingService: Send + Sync {
    /// Generate an embedding vector for the given text.
    fn embed(
        &self,
        text: &str,
    ) -> impl std::future::Future<Output = Result<Vec<f32>, MarginaliaError>> + Send;

    /// Produce a textual description of the image at `image_url`.
    ///
    /// Services without vision support fail with `Upstream`.
    fn describe_image(
        &self,
        image_url: &str,
    ) -> impl std::future::Future<Output = Result<String, MarginaliaError>> + Send {
        let image_url = image_url.to_string();
        async move {
            Err(MarginaliaError::Upstream(format!(
                "image description is not supported by this provider ({})",
                image_url
            )))
        }
    }

    /// Return the dimensionality of vectors produced by this service.
    fn dimensions(&self) -> usize;
}

type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, MarginaliaError>> + Send + 'a>>;

/// Object-safe version of [`EmbeddingService`] for dynamic dispatch.
///
/// A blanket implementation is provided so that every `EmbeddingService`
/// automatically implements `DynEmbeddingService`.
pub trait DynEmbeddingService: Send + Sync {
    fn embed_boxed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Vec<f32>>;

    fn describe_image_boxed<'a>(&'a self, image_url: &'a str) -> BoxFuture<'a, String>;

    fn dimensions(&self) -> usize;
}

impl<T: EmbeddingService> DynEmbeddingService for T {
    fn embed_boxed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Vec<f32>> {
        Box::pin(self.embed(text))
    }

    fn describe_image_boxed<'a>(&'a self, image_url: &'a str) -> BoxFuture<'a, String> {
        Box::pin(self.describe_image(image_url))
    }

    fn dimensions(&self) -> usize {
        EmbeddingService::dimensions(self)
    }
}

// ---------------------------------------------------------------------------
// HttpEmbeddingService - OpenAI-compatible API
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

const IMAGE_PROMPT: &str = "Describe this image in one detailed paragraph. \
Mention the subject, setting, notable objects, and any visible text.";

/// Embedding service backed by an OpenAI-compatible HTTP API.
pub struct HttpEmbeddingService {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    vision_model: String,
    dimensions: usize,
}

impl std::fmt::Debug for HttpEmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbeddingService")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl HttpEmbeddingService {
    /// Build a service from configuration, reading the API key from the
    /// environment variable named by `api_key_env`.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, MarginaliaError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            MarginaliaError::Config(format!(
                "environment variable {} is not set",
                config.api_key_env
            ))
        })?;
        Self::new(config, api_key)
    }

    /// Build a service with an explicit API key.
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self, MarginaliaError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MarginaliaError::Config(format!("Failed to build HTTP client: {}", e)))?;

        info!(
            base_url = %config.base_url,
            model = %config.model,
            dimensions = config.dimensions,
            "HTTP embedding service configured"
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            vision_model: config.vision_model.clone(),
            dimensions: config.dimensions,
        })
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, MarginaliaError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| MarginaliaError::Upstream(format!("{} request failed: {}", path, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, path, "Embedding provider returned an error");
            return Err(MarginaliaError::Upstream(format!(
                "{} returned HTTP {}: {}",
                path, status, body
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| MarginaliaError::Upstream(format!("{} response malformed: {}", path, e)))
    }
}

impl EmbeddingService for HttpEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MarginaliaError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
        };
        let response: EmbeddingResponse = self.post("embeddings", &request).await?;
        let embedding = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| MarginaliaError::Upstream("embeddings response was empty".into()))?;

        debug!(dims = embedding.len(), "Text embedded");
        Ok(embedding)
    }

    async fn describe_image(&self, image_url: &str) -> Result<String, MarginaliaError> {
        let request = serde_json::json!({
            "model": self.vision_model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": IMAGE_PROMPT },
                    { "type": "image_url", "image_url": { "url": image_url } }
                ]
            }]
        });
        let response: ChatResponse = self.post("chat/completions", &request).await?;
        let description = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| MarginaliaError::Upstream("image description was empty".into()))?;

        debug!(chars = description.len(), "Image described");
        Ok(description)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ---------------------------------------------------------------------------
// MockEmbedding - deterministic hash-based vectors for testing
// ---------------------------------------------------------------------------

/// Mock embedding service that returns deterministic unit vectors.
///
/// The output is derived from a hash of the input text, so identical inputs
/// always produce identical outputs. Images are "described" by echoing
/// their URL.
#[derive(Debug, Clone)]
pub struct MockEmbedding {
    dimensions: usize,
}

impl MockEmbedding {
    /// A mock producing 1536-dimensional vectors.
    pub fn new() -> Self {
        Self::with_dimensions(1536)
    }

    pub fn with_dimensions(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn hash_to_vector(&self, text: &str) -> Vec<f32> {
        let mut result = Vec::with_capacity(self.dimensions);
        for i in 0..self.dimensions {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            i.hash(&mut hasher);
            let h = hasher.finish();
            let val = ((h as f64) / (u64::MAX as f64)) * 2.0 - 1.0;
            result.push(val as f32);
        }

        let norm: f32 = result.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for val in &mut result {
                *val /= norm;
            }
        }

        result
    }
}

impl Default for MockEmbedding {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingService for MockEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MarginaliaError> {
        if text.trim().is_empty() {
            return Err(MarginaliaError::Upstream(
                "Cannot embed empty text".to_string(),
            ));
        }
        Ok(self.hash_to_vector(text))
    }

    async fn describe_image(&self, image_url: &str) -> Result<String, MarginaliaError> {
        Ok(format!("An image located at {}", image_url))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
