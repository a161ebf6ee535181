//! Search engine combining query embedding with the similarity index.
//!
//! SearchEngine embeds free-text queries through the configured provider,
//! ranks candidates with the [`SimilarityIndex`], and resolves the hits
//! back to stored entries.

use std::sync::Arc;

use tracing::{debug, info};

use marginalia_core::error::MarginaliaError;
use marginalia_core::types::ScoredEntry;
use marginalia_storage::EntryRepository;

use crate::embedding::DynEmbeddingService;
use crate::index::{IndexStats, SimilarityIndex};

/// Semantic search over stored entries.
///
/// Uses dynamic dispatch (`Arc<dyn DynEmbeddingService>`) so that production
/// code can supply `HttpEmbeddingService` while tests use `MockEmbedding`.
pub struct SearchEngine {
    index: Arc<SimilarityIndex>,
    repo: Arc<EntryRepository>,
    embedder: Arc<dyn DynEmbeddingService>,
}

impl SearchEngine {
    pub fn new(
        index: Arc<SimilarityIndex>,
        repo: Arc<EntryRepository>,
        embedder: Arc<dyn DynEmbeddingService>,
    ) -> Self {
        Self {
            index,
            repo,
            embedder,
        }
    }

    /// Embed `query` and return the `k` most similar entries.
    pub async fn search_text(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredEntry>, MarginaliaError> {
        if query.trim().is_empty() {
            return Err(MarginaliaError::Validation(
                "query must not be empty".to_string(),
            ));
        }
        if k == 0 {
            return Err(MarginaliaError::Validation(
                "limit must be at least 1".to_string(),
            ));
        }

        let query_vec = self.embedder.embed_boxed(query).await?;
        if query_vec.len() != self.repo.dimensions() {
            return Err(MarginaliaError::Upstream(format!(
                "provider returned {} dimensions, expected {}",
                query_vec.len(),
                self.repo.dimensions()
            )));
        }

        self.search_vector(&query_vec, k)
    }

    /// Return the `k` entries most similar to `query`, most similar first.
    ///
    /// Entries come back without their embeddings.
    pub fn search_vector(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredEntry>, MarginaliaError> {
        let hits = self.index.search(query, k)?;
        let ids: Vec<_> = hits.iter().map(|h| h.id).collect();
        let entries = self.repo.get_many(&ids, false)?;

        // get_many keeps the hit order and skips ids it cannot resolve.
        let mut results = Vec::with_capacity(entries.len());
        let mut hits = hits.into_iter();
        for entry in entries {
            if let Some(hit) = hits.by_ref().find(|h| h.id == entry.id) {
                results.push(ScoredEntry {
                    entry,
                    similarity: hit.similarity,
                });
            }
        }

        debug!(k, results = results.len(), "Similarity search complete");
        Ok(results)
    }

    /// Rebuild the index from every stored vector.
    pub fn rebuild_index(&self) -> Result<IndexStats, MarginaliaError> {
        let vectors = self.repo.load_vectors()?;
        info!(count = vectors.len(), "Rebuilding similarity index");
        self.index.rebuild(vectors)
    }

    /// Get a reference to the underlying similarity index.
    pub fn index(&self) -> &SimilarityIndex {
        &self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingService, MockEmbedding};
    use crate::index::IndexConfig;
    use marginalia_core::types::EntryMetadata;
    use marginalia_storage::Database;
    use uuid::Uuid;

    const DIMS: usize = 8;

    fn make_engine() -> (Arc<EntryRepository>, SearchEngine) {
        let db = Arc::new(Database::in_memory().unwrap());
        let repo = Arc::new(EntryRepository::new(db, DIMS));
        let index = Arc::new(SimilarityIndex::new(IndexConfig::exact(DIMS)));
        let engine = SearchEngine::new(
            index,
            Arc::clone(&repo),
            Arc::new(MockEmbedding::with_dimensions(DIMS)),
        );
        (repo, engine)
    }

    fn store(repo: &EntryRepository, engine: &SearchEngine, content: &str, embedding: Vec<f32>) -> Uuid {
        let (entry, vector) = repo
            .insert_with_vector(content, EntryMetadata::new("Article", "u"), embedding)
            .unwrap();
        engine.index().insert(vector).unwrap();
        entry.id
    }

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIMS];
        v[i] = 1.0;
        v
    }

    #[tokio::test]
    async fn test_search_empty_store() {
        let (_, engine) = make_engine();
        assert!(engine.search_text("anything", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_text_finds_matching_entry() {
        let (repo, engine) = make_engine();
        let embedder = MockEmbedding::with_dimensions(DIMS);
        let target = embedder.embed("the borrow checker").await.unwrap();
        let id = store(&repo, &engine, "the borrow checker", target);
        store(&repo, &engine, "other", axis(0));

        let results = engine.search_text("the borrow checker", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.id, id);
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
        assert!(results[0].entry.embedding.is_none());
    }

    #[tokio::test]
    async fn test_search_rejects_bad_input() {
        let (_, engine) = make_engine();
        assert!(matches!(
            engine.search_text("  ", 5).await,
            Err(MarginaliaError::Validation(_))
        ));
        assert!(matches!(
            engine.search_text("q", 0).await,
            Err(MarginaliaError::Validation(_))
        ));
        assert!(matches!(
            engine.search_vector(&[1.0; DIMS + 2], 3),
            Err(MarginaliaError::Validation(_))
        ));
    }

    #[test]
    fn test_three_entry_scenario() {
        let (repo, engine) = make_engine();
        let a = store(&repo, &engine, "a", axis(0));
        let b = store(&repo, &engine, "b", axis(1));
        let c = store(&repo, &engine, "c", axis(2));

        let top = engine.search_vector(&axis(0), 1).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].entry.id, a);
        assert!((top[0].similarity - 1.0).abs() < 1e-9);

        let mut query = axis(1);
        query[2] = 0.5;
        let ranked: Vec<_> = engine
            .search_vector(&query, 3)
            .unwrap()
            .into_iter()
            .map(|s| s.entry.id)
            .collect();
        assert_eq!(ranked, vec![b, c, a]);
    }

    #[test]
    fn test_rebuild_index_from_store() {
        let (repo, engine) = make_engine();
        for i in 0..5 {
            repo.insert(&format!("e{}", i), EntryMetadata::new("A", "u"), axis(i))
                .unwrap();
        }
        assert!(engine.index().is_empty());

        let stats = engine.rebuild_index().unwrap();
        assert_eq!(stats.vectors, 5);
        assert_eq!(engine.search_vector(&axis(3), 1).unwrap()[0].entry.content, "e3");
    }
}
