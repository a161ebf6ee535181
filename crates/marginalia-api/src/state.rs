//! Application state shared across all route handlers.
//!
//! AppState wires the storage, search, join and layout components together
//! around one database and one embedding provider. It is passed to
//! handlers via axum's State extractor.

use std::sync::Arc;
use std::time::Instant;

use marginalia_core::config::MarginaliaConfig;
use marginalia_layout::{LayoutProjector, ProjectorConfig};
use marginalia_storage::{Database, EntryRepository, JoinGraph};
use marginalia_vector::{DynEmbeddingService, IndexConfig, IngestPipeline, SearchEngine, SimilarityIndex};

/// Shared application state.
///
/// All fields use `Arc` for cheap cloning across handler tasks.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (read-only after startup).
    pub config: Arc<MarginaliaConfig>,
    /// Durable entry store.
    pub repo: Arc<EntryRepository>,
    /// Symmetric joins between entries.
    pub graph: Arc<JoinGraph>,
    /// Similarity search over the in-memory index.
    pub search: Arc<SearchEngine>,
    /// Embed-and-store ingestion.
    pub pipeline: Arc<IngestPipeline>,
    /// 2D projection for the graph view.
    pub projector: Arc<LayoutProjector>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Build every component over `database` and `embedder`.
    ///
    /// The similarity index starts empty; call
    /// [`SearchEngine::rebuild_index`] to load stored vectors.
    pub fn new(
        config: MarginaliaConfig,
        database: Database,
        embedder: Arc<dyn DynEmbeddingService>,
    ) -> Self {
        let dimensions = config.embedding.dimensions;
        let repo = Arc::new(EntryRepository::new(Arc::new(database), dimensions));
        let index = Arc::new(SimilarityIndex::new(IndexConfig::from_search_config(
            &config.search,
            dimensions,
        )));
        let graph = JoinGraph::new(Arc::clone(&repo), config.graph.join_max_retries);
        let search = SearchEngine::new(Arc::clone(&index), Arc::clone(&repo), Arc::clone(&embedder));
        let pipeline = IngestPipeline::new(Arc::clone(&repo), index, embedder);
        let projector =
            LayoutProjector::new(ProjectorConfig::from_layout_config(&config.layout, dimensions));

        Self {
            config: Arc::new(config),
            repo,
            graph: Arc::new(graph),
            search: Arc::new(search),
            pipeline: Arc::new(pipeline),
            projector: Arc::new(projector),
            start_time: Instant::now(),
        }
    }
}
