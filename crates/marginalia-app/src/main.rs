//! Marginalia application binary - composition root.
//!
//! Ties the Marginalia crates into a single executable:
//! 1. Parse CLI flags and load configuration from TOML
//! 2. Open the SQLite entry store
//! 3. Select the embedding provider (OpenAI-compatible or mock)
//! 4. Build the similarity index from stored vectors
//! 5. Start the optional periodic index rebuild
//! 6. Start the axum REST API server

mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use marginalia_api::routes;
use marginalia_api::state::AppState;
use marginalia_core::config::{EmbeddingConfig, MarginaliaConfig};
use marginalia_core::error::MarginaliaError;
use marginalia_storage::Database;
use marginalia_vector::{DynEmbeddingService, HttpEmbeddingService, MockEmbedding, SearchEngine};

use crate::cli::CliArgs;

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    match data_dir.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(rest)
        }
        None => PathBuf::from(data_dir),
    }
}

/// Pick the embedding provider. A misconfigured provider is a startup error;
/// the mock is only used when asked for.
fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn DynEmbeddingService>, MarginaliaError> {
    match config.provider.as_str() {
        "openai" => {
            let service = HttpEmbeddingService::from_config(config)?;
            tracing::info!(
                model = %config.model,
                base_url = %config.base_url,
                "Using OpenAI-compatible embedding provider"
            );
            Ok(Arc::new(service))
        }
        "mock" => {
            tracing::info!(dimensions = config.dimensions, "Using mock embeddings");
            Ok(Arc::new(MockEmbedding::with_dimensions(config.dimensions)))
        }
        other => Err(MarginaliaError::Config(format!(
            "Unknown embedding provider '{}'. Must be 'openai' or 'mock'",
            other
        ))),
    }
}

/// Rebuild the similarity index every `interval_secs` so approximate lists
/// pick up entries inserted since the last rebuild.
async fn index_rebuild_loop(search: Arc<SearchEngine>, interval_secs: u64) {
    tracing::info!(interval_secs, "Periodic index rebuild started");

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    // The first tick completes immediately; startup already rebuilt.
    interval.tick().await;

    loop {
        interval.tick().await;
        let search = Arc::clone(&search);
        match tokio::task::spawn_blocking(move || search.rebuild_index()).await {
            Ok(Ok(stats)) => tracing::debug!(
                vectors = stats.vectors,
                approximate = stats.approximate,
                "Periodic index rebuild complete"
            ),
            Ok(Err(e)) => tracing::warn!(error = %e, "Periodic index rebuild failed"),
            Err(e) => tracing::warn!(error = %e, "Periodic index rebuild task panicked"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = MarginaliaConfig::load_or_default(&config_file);
    config.general.port = args.resolve_port(config.general.port);
    if let Some(ref dir) = args.data_dir {
        config.general.data_dir = dir.to_string_lossy().to_string();
    }
    if let Some(ref level) = args.log_level {
        config.general.log_level = level.clone();
    }
    if let Some(ref provider) = args.provider {
        config.embedding.provider = provider.clone();
    }

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Marginalia v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration resolved");
    config.validate()?;

    // Storage.
    let data_dir = resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("marginalia.db");
    let db = Database::new(&db_path)?;
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    // Components.
    let embedder = match build_embedder(&config.embedding) {
        Ok(embedder) => embedder,
        Err(e) => {
            tracing::error!(provider = %config.embedding.provider, error = %e, "Embedding provider unavailable");
            return Err(e.into());
        }
    };
    let state = AppState::new(config.clone(), db, embedder);

    let stats = state.search.rebuild_index()?;
    tracing::info!(
        vectors = stats.vectors,
        lists = stats.lists,
        approximate = stats.approximate,
        "Similarity index ready"
    );

    match state.graph.audit() {
        Ok(audit) if audit.is_consistent() => tracing::debug!("Join audit clean"),
        Ok(audit) => tracing::warn!(
            asymmetric = audit.asymmetric.len(),
            self_links = audit.self_links.len(),
            dangling = audit.dangling.len(),
            "Join audit found inconsistent joins"
        ),
        Err(e) => tracing::warn!(error = %e, "Join audit failed"),
    }

    // === Background tasks ===

    if config.search.rebuild_interval_secs > 0 {
        let search = Arc::clone(&state.search);
        let interval_secs = config.search.rebuild_interval_secs;
        tokio::spawn(async move {
            index_rebuild_loop(search, interval_secs).await;
        });
    }

    // === API server ===

    if let Err(e) = routes::start_server(&config, state).await {
        tracing::error!(port = config.general.port, error = %e, "API server stopped - is another instance running?");
        return Err(e.into());
    }

    Ok(())
}
