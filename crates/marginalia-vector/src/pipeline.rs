//! Marginalia ingestion pipeline.
//!
//! The IngestPipeline turns incoming highlights (text fragments or image
//! URLs) into stored, indexed entries:
//! 1. Input validation (before any provider call)
//! 2. Image description, for image highlights
//! 3. Embedding generation
//! 4. Atomic insert into the entry store
//! 5. Similarity index insertion

use std::sync::Arc;

use tracing::{info, warn};

use marginalia_core::error::MarginaliaError;
use marginalia_core::types::{Entry, EntryMetadata};
use marginalia_storage::EntryRepository;

use crate::embedding::DynEmbeddingService;
use crate::index::SimilarityIndex;

/// Ingests highlights into the store and the similarity index.
pub struct IngestPipeline {
    repo: Arc<EntryRepository>,
    index: Arc<SimilarityIndex>,
    embedder: Arc<dyn DynEmbeddingService>,
}

impl IngestPipeline {
    pub fn new(
        repo: Arc<EntryRepository>,
        index: Arc<SimilarityIndex>,
        embedder: Arc<dyn DynEmbeddingService>,
    ) -> Self {
        Self {
            repo,
            index,
            embedder,
        }
    }

    /// Embed and store a text highlight.
    pub async fn ingest_text(
        &self,
        content: &str,
        metadata: EntryMetadata,
    ) -> Result<Entry, MarginaliaError> {
        validate_request(Some(content), &metadata)?;
        let embedding = self.embed(content).await?;
        self.store(content, metadata, embedding)
    }

    /// Describe an image, then embed and store the description.
    ///
    /// The description becomes the entry content and `image_url` is
    /// recorded in the metadata.
    pub async fn ingest_image(
        &self,
        image_url: &str,
        mut metadata: EntryMetadata,
    ) -> Result<Entry, MarginaliaError> {
        let image_url = image_url.trim();
        if image_url.is_empty() {
            return Err(MarginaliaError::Validation(
                "image_url must not be empty".to_string(),
            ));
        }
        validate_request(None, &metadata)?;

        let description = self.embedder.describe_image_boxed(image_url).await?;
        if description.trim().is_empty() {
            return Err(MarginaliaError::Upstream(
                "provider returned an empty image description".to_string(),
            ));
        }

        metadata.image_url = Some(image_url.to_string());
        let embedding = self.embed(&description).await?;
        self.store(&description, metadata, embedding)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MarginaliaError> {
        let embedding = self.embedder.embed_boxed(text).await.map_err(|e| {
            warn!(error = %e, "Embedding provider failed");
            e
        })?;

        // A provider returning the wrong shape is a provider fault, not bad input.
        let expected = self.repo.dimensions();
        if embedding.len() != expected || embedding.iter().any(|v| !v.is_finite()) {
            return Err(MarginaliaError::Upstream(format!(
                "provider returned an unusable embedding ({} dimensions, expected {})",
                embedding.len(),
                expected
            )));
        }
        Ok(embedding)
    }

    fn store(
        &self,
        content: &str,
        metadata: EntryMetadata,
        embedding: Vec<f32>,
    ) -> Result<Entry, MarginaliaError> {
        let (entry, vector) = self.repo.insert_with_vector(content, metadata, embedding)?;
        // The store is authoritative; a failed index insert heals on the next rebuild.
        if let Err(e) = self.index.insert(vector) {
            warn!(entry_id = %entry.id, error = %e, "Index insert failed");
        }
        info!(
            entry_id = %entry.id,
            article = %entry.metadata.article,
            image = entry.metadata.image_url.is_some(),
            "Highlight ingested"
        );
        Ok(entry)
    }
}

/// Reject requests the store would refuse, before paying for a provider call.
fn validate_request(content: Option<&str>, metadata: &EntryMetadata) -> Result<(), MarginaliaError> {
    if let Some(content) = content {
        if content.trim().is_empty() {
            return Err(MarginaliaError::Validation(
                "content must not be empty".to_string(),
            ));
        }
    }
    if metadata.article.trim().is_empty() {
        return Err(MarginaliaError::Validation(
            "metadata.article must not be empty".to_string(),
        ));
    }
    if !metadata.joins.is_empty() {
        return Err(MarginaliaError::Validation(
            "new entries cannot carry joins".to_string(),
        ));
    }
    Ok(())
}
