//! Marginalia Vector crate - embedding providers, similarity index, search, and ingestion.
//!
//! Provides the embedding service boundary (OpenAI-compatible HTTP client
//! plus a deterministic mock), an in-memory cosine similarity index with an
//! inverted-file mode for large collections, a search engine resolving hits
//! to stored entries, and the ingestion pipeline.

pub mod embedding;
pub mod index;
pub mod pipeline;
pub mod search;

pub use embedding::{DynEmbeddingService, EmbeddingService, HttpEmbeddingService, MockEmbedding};
pub use index::{IndexConfig, IndexStats, SearchHit, SimilarityIndex};
pub use pipeline::IngestPipeline;
pub use search::SearchEngine;
