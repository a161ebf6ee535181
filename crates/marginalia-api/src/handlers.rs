//! Route handler functions for all API endpoints.
//!
//! Each handler extracts query/path parameters via axum extractors,
//! interacts with AppState services, and returns JSON responses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use marginalia_core::types::{group_by_source, Entry, EntryMetadata, EntryOrder, ListOptions, ScoredEntry};
use marginalia_layout::{LayoutError, PlacedEntry};
use marginalia_storage::{JoinEdge, JoinGraph};

use crate::error::ApiError;
use crate::state::AppState;

/// Page size for `GET /entries` when no limit is given.
const DEFAULT_LIST_LIMIT: u64 = 50;

// =============================================================================
// Query parameter and request types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// A page size, or `all`.
    pub limit: Option<String>,
    pub offset: Option<u64>,
    /// `newest` (default) or `oldest`.
    pub order: Option<String>,
    /// Only `article-section` is supported.
    pub group_by: Option<String>,
    pub include_embedding: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct GraphParams {
    /// A count or "all"; capped at `layout.max_entries` either way.
    pub limit: Option<String>,
}

/// Request body for POST /entries.
#[derive(Debug, Deserialize)]
pub struct AddEntryRequest {
    pub content: String,
    pub metadata: EntryMetadata,
}

/// Request body for POST /entries/image.
#[derive(Debug, Deserialize)]
pub struct AddImageRequest {
    pub image_url: String,
    pub metadata: EntryMetadata,
}

/// Request body for POST /search.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub limit: Option<usize>,
}

/// Request body for POST /join. Ids are parsed by the handler so that a
/// malformed id is reported like any other invalid input.
#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub id1: String,
    pub id2: String,
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub total_entries: u64,
    pub index_size: u64,
    pub index_approximate: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntryResponse {
    pub entry: Entry,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddEntryResponse {
    pub success: bool,
    pub entry: Entry,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntriesResponse {
    pub entries: Vec<Entry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntryGroup {
    pub key: String,
    pub entries: Vec<Entry>,
}

/// Body of `GET /entries`: either a flat page or grouped by source.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListResponse {
    Flat { entries: Vec<Entry>, total: u64 },
    Grouped { grouped: Vec<EntryGroup>, total: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<ScoredEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub success: bool,
    pub joined: [Uuid; 2],
}

#[derive(Debug, Serialize)]
pub struct GraphResponse {
    pub nodes: Vec<PlacedEntry>,
    pub edges: Vec<JoinEdge>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RebuildResponse {
    pub indexed: usize,
    pub approximate: bool,
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::BadRequest(format!("'{}' is not a valid entry id", raw)))
}

fn parse_list_options(params: &ListParams) -> Result<ListOptions, ApiError> {
    let limit = match params.limit.as_deref().map(str::trim) {
        None => Some(DEFAULT_LIST_LIMIT),
        Some("all") => None,
        Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
            ApiError::BadRequest(format!("Invalid limit '{}'. Must be a number or 'all'", raw))
        })?),
    };

    let order = match params.order.as_deref() {
        None | Some("newest") => EntryOrder::NewestFirst,
        Some("oldest") => EntryOrder::OldestFirst,
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "Invalid order '{}'. Must be one of: newest, oldest",
                other
            )))
        }
    };

    Ok(ListOptions {
        order,
        limit,
        offset: params.offset.unwrap_or(0),
        include_embedding: params.include_embedding.unwrap_or(false),
    })
}

fn parse_graph_limit(raw: Option<&str>, max: usize) -> Result<usize, ApiError> {
    match raw.map(str::trim) {
        None | Some("all") => Ok(max),
        Some(raw) => raw.parse::<usize>().map(|n| n.min(max)).map_err(|_| {
            ApiError::BadRequest(format!("Invalid limit '{}'. Must be a number or 'all'", raw))
        }),
    }
}

// =============================================================================
// Handler functions
// =============================================================================

/// GET /health - health check.
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let stats = state.search.index().stats();
    let total_entries = state.repo.count()?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        total_entries,
        index_size: stats.vectors as u64,
        index_approximate: stats.approximate,
    }))
}

/// POST /entries - embed and store a text highlight.
pub async fn add_entry(
    State(state): State<AppState>,
    Json(body): Json<AddEntryRequest>,
) -> Result<Json<AddEntryResponse>, ApiError> {
    let entry = state.pipeline.ingest_text(&body.content, body.metadata).await?;
    Ok(Json(AddEntryResponse {
        success: true,
        entry: entry.without_embedding(),
    }))
}

/// POST /entries/image - describe an image and store the description.
pub async fn add_image(
    State(state): State<AppState>,
    Json(body): Json<AddImageRequest>,
) -> Result<Json<AddEntryResponse>, ApiError> {
    let entry = state
        .pipeline
        .ingest_image(&body.image_url, body.metadata)
        .await?;
    Ok(Json(AddEntryResponse {
        success: true,
        entry: entry.without_embedding(),
    }))
}

/// GET /entries - list entries, optionally grouped by article and section.
pub async fn list_entries(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
    let options = parse_list_options(&params)?;
    let entries = state.repo.list(&options)?;
    let total = state.repo.count()?;

    match params.group_by.as_deref() {
        None => Ok(Json(ListResponse::Flat { entries, total })),
        Some("article-section") => {
            let grouped = group_by_source(entries)
                .into_iter()
                .map(|(key, entries)| EntryGroup { key, entries })
                .collect();
            Ok(Json(ListResponse::Grouped { grouped, total }))
        }
        Some(other) => Err(ApiError::BadRequest(format!(
            "Invalid group_by '{}'. Must be: article-section",
            other
        ))),
    }
}

/// GET /entries/random - one entry chosen uniformly from the whole store.
pub async fn random_entry(State(state): State<AppState>) -> Result<Json<EntryResponse>, ApiError> {
    let entry = state
        .repo
        .sample_random()?
        .ok_or_else(|| ApiError::NotFound("No entries stored yet".to_string()))?;
    Ok(Json(EntryResponse {
        entry: entry.without_embedding(),
    }))
}

/// GET /entries/{id} - a single entry.
pub async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntryResponse>, ApiError> {
    let entry = state.repo.get(parse_id(&id)?)?;
    Ok(Json(EntryResponse {
        entry: entry.without_embedding(),
    }))
}

/// GET /entries/{id}/neighbors - the entries joined to `id`.
pub async fn neighbors(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntriesResponse>, ApiError> {
    let entries = state.graph.neighbors(parse_id(&id)?)?;
    Ok(Json(EntriesResponse { entries }))
}

/// POST /search - entries most similar to a text query.
pub async fn search(
    State(state): State<AppState>,
    Json(body): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let k = body
        .limit
        .unwrap_or(state.config.search.default_limit)
        .min(state.config.search.max_limit);
    let results = state.search.search_text(&body.query, k).await?;
    Ok(Json(SearchResponse { results }))
}

/// POST /join - connect two entries symmetrically.
pub async fn join(
    State(state): State<AppState>,
    Json(body): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    let id1 = parse_id(&body.id1)?;
    let id2 = parse_id(&body.id2)?;
    let outcome = state.graph.join(id1, id2)?;
    Ok(Json(JoinResponse {
        success: true,
        joined: outcome.joined,
    }))
}

/// GET /graph - the newest entries laid out in 2D, with their joins.
///
/// Projection runs on a blocking thread. If it does not finish within
/// `layout.timeout_secs` it is cancelled and no graph is returned.
pub async fn graph(
    State(state): State<AppState>,
    Query(params): Query<GraphParams>,
) -> Result<Json<GraphResponse>, ApiError> {
    let limit = parse_graph_limit(params.limit.as_deref(), state.config.layout.max_entries)?;
    let entries = state.repo.list(&ListOptions {
        limit: Some(limit as u64),
        ..ListOptions::all_with_embeddings()
    })?;
    let edges = JoinGraph::edges(&entries);

    let cancel = Arc::new(AtomicBool::new(false));
    let projector = Arc::clone(&state.projector);
    let flag = Arc::clone(&cancel);
    let task = tokio::task::spawn_blocking(move || projector.project_cancellable(entries, &flag));

    let budget = Duration::from_secs(state.config.layout.timeout_secs);
    let placed = match tokio::time::timeout(budget, task).await {
        Ok(Ok(Ok(placed))) => placed,
        Ok(Ok(Err(LayoutError::Cancelled))) | Err(_) => {
            cancel.store(true, Ordering::Relaxed);
            return Err(ApiError::GatewayTimeout(format!(
                "Layout did not finish within {}s",
                budget.as_secs()
            )));
        }
        Ok(Ok(Err(e))) => return Err(ApiError::Internal(e.to_string())),
        Ok(Err(e)) => return Err(ApiError::Internal(format!("Layout task failed: {}", e))),
    };

    let nodes = placed
        .into_iter()
        .map(|p| PlacedEntry {
            entry: p.entry.without_embedding(),
            x: p.x,
            y: p.y,
        })
        .collect();
    Ok(Json(GraphResponse { nodes, edges }))
}

/// POST /index/rebuild - rebuild the similarity index from the store.
pub async fn rebuild_index(State(state): State<AppState>) -> Result<Json<RebuildResponse>, ApiError> {
    let search = Arc::clone(&state.search);
    let stats = tokio::task::spawn_blocking(move || search.rebuild_index())
        .await
        .map_err(|e| ApiError::Internal(format!("Rebuild task failed: {}", e)))??;
    Ok(Json(RebuildResponse {
        indexed: stats.vectors,
        approximate: stats.approximate,
    }))
}
