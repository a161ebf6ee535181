//! Integration tests for the Marginalia API.
//!
//! Each test builds its own router over an in-memory database and a mock
//! embedding provider, then drives it with `oneshot` requests.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use marginalia_api::handlers::{
    AddEntryResponse, EntryResponse, HealthResponse, JoinResponse, RebuildResponse,
    SearchResponse,
};
use marginalia_api::{create_router, AppState};
use marginalia_core::config::MarginaliaConfig;
use marginalia_storage::Database;
use marginalia_vector::{DynEmbeddingService, MockEmbedding};

// =============================================================================
// Helpers
// =============================================================================

const DIMS: usize = 8;

fn test_config() -> MarginaliaConfig {
    let mut config = MarginaliaConfig::default();
    config.embedding.dimensions = DIMS;
    config
}

fn make_state(config: MarginaliaConfig) -> AppState {
    let embedder: Arc<dyn DynEmbeddingService> = Arc::new(MockEmbedding::with_dimensions(DIMS));
    AppState::new(config, Database::in_memory().unwrap(), embedder)
}

fn make_app() -> axum::Router {
    create_router(make_state(test_config()))
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(resp: axum::response::Response) -> T {
    let bytes = axum::body::to_bytes(resp.into_body(), 4 * 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// POST /entries and return the stored entry id.
async fn add(app: &axum::Router, content: &str, article: &str, section: Option<&str>) -> Uuid {
    let mut metadata = json!({ "article": article, "url": "https://en.wikipedia.org/wiki/Test" });
    if let Some(section) = section {
        metadata["section"] = json!(section);
    }
    let resp = app
        .clone()
        .oneshot(post_json(
            "/entries",
            json!({ "content": content, "metadata": metadata }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: AddEntryResponse = body_json(resp).await;
    assert!(body.success);
    body.entry.id
}

async fn join(app: &axum::Router, id1: &str, id2: &str) -> axum::response::Response {
    app.clone()
        .oneshot(post_json("/join", json!({ "id1": id1, "id2": id2 })))
        .await
        .unwrap()
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_reports_counts() {
    let app = make_app();
    add(&app, "Ownership rules apply to every value.", "Rust", None).await;

    let resp = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let health: HealthResponse = body_json(resp).await;
    assert_eq!(health.status, "healthy");
    assert_eq!(health.total_entries, 1);
    assert_eq!(health.index_size, 1);
    assert!(!health.index_approximate);
}

// =============================================================================
// Entries
// =============================================================================

#[tokio::test]
async fn test_add_and_get_entry() {
    let app = make_app();
    let id = add(&app, "The borrow checker enforces aliasing rules.", "Rust", Some("Safety")).await;

    let resp = app
        .clone()
        .oneshot(get(&format!("/entries/{}", id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: EntryResponse = body_json(resp).await;
    assert_eq!(body.entry.id, id);
    assert_eq!(body.entry.content, "The borrow checker enforces aliasing rules.");
    assert_eq!(body.entry.metadata.section.as_deref(), Some("Safety"));
    assert!(body.entry.metadata.joins.is_empty());
    assert!(body.entry.embedding.is_none());
}

#[tokio::test]
async fn test_add_entry_rejects_blank_content() {
    let app = make_app();
    let resp = app
        .oneshot(post_json(
            "/entries",
            json!({ "content": "   ", "metadata": { "article": "Rust", "url": "u" } }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = body_json(resp).await;
    assert_eq!(body["error"], "bad_request");
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn test_add_image_entry() {
    let app = make_app();
    let resp = app
        .clone()
        .oneshot(post_json(
            "/entries/image",
            json!({
                "image_url": "https://upload.wikimedia.org/mona_lisa.jpg",
                "metadata": { "article": "Mona Lisa", "url": "https://en.wikipedia.org/wiki/Mona_Lisa" }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: AddEntryResponse = body_json(resp).await;
    assert_eq!(
        body.entry.metadata.image_url.as_deref(),
        Some("https://upload.wikimedia.org/mona_lisa.jpg")
    );
    assert!(body.entry.content.contains("mona_lisa.jpg"));
}

#[tokio::test]
async fn test_get_entry_malformed_id() {
    let app = make_app();
    let resp = app.oneshot(get("/entries/not-a-uuid")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_entry_not_found() {
    let app = make_app();
    let resp = app
        .oneshot(get(&format!("/entries/{}", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = body_json(resp).await;
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_list_entries_order_and_limit() {
    let app = make_app();
    let first = add(&app, "first highlight", "A", None).await;
    let second = add(&app, "second highlight", "A", None).await;
    let third = add(&app, "third highlight", "B", None).await;

    let resp = app.clone().oneshot(get("/entries?limit=2")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = body_json(resp).await;
    assert_eq!(body["total"], 3);
    let ids: Vec<&str> = body["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![third.to_string(), second.to_string()]);

    let resp = app
        .clone()
        .oneshot(get("/entries?limit=all&order=oldest"))
        .await
        .unwrap();
    let body: Value = body_json(resp).await;
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["id"], first.to_string());
    assert!(entries[0].get("embedding").is_none());
}

#[tokio::test]
async fn test_list_entries_with_embeddings() {
    let app = make_app();
    add(&app, "a highlight", "A", None).await;

    let resp = app
        .oneshot(get("/entries?include_embedding=true"))
        .await
        .unwrap();
    let body: Value = body_json(resp).await;
    let embedding = body["entries"][0]["embedding"].as_array().unwrap();
    assert_eq!(embedding.len(), DIMS);
}

#[tokio::test]
async fn test_list_entries_grouped() {
    let app = make_app();
    add(&app, "one", "Rust", Some("History")).await;
    add(&app, "two", "Go", None).await;
    add(&app, "three", "Rust", Some("History")).await;

    let resp = app
        .oneshot(get("/entries?group_by=article-section&order=oldest"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = body_json(resp).await;
    assert_eq!(body["total"], 3);
    let groups = body["grouped"].as_array().unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["key"], "Rust > History");
    assert_eq!(groups[0]["entries"].as_array().unwrap().len(), 2);
    assert_eq!(groups[1]["key"], "Go");
}

#[tokio::test]
async fn test_list_entries_bad_params() {
    let app = make_app();
    for uri in [
        "/entries?limit=lots",
        "/entries?order=sideways",
        "/entries?group_by=color",
    ] {
        let resp = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", uri);
    }
}

#[tokio::test]
async fn test_random_entry() {
    let app = make_app();
    let resp = app.clone().oneshot(get("/entries/random")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let id = add(&app, "only one", "A", None).await;
    let resp = app.oneshot(get("/entries/random")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: EntryResponse = body_json(resp).await;
    assert_eq!(body.entry.id, id);
}

// =============================================================================
// Search
// =============================================================================

#[tokio::test]
async fn test_search_exact_match_ranks_first() {
    let app = make_app();
    add(&app, "Lifetimes name the scope of a borrow.", "Rust", None).await;
    let target = add(&app, "Traits define shared behavior.", "Rust", None).await;
    add(&app, "Goroutines are lightweight threads.", "Go", None).await;

    let resp = app
        .oneshot(post_json(
            "/search",
            json!({ "query": "Traits define shared behavior.", "limit": 1 }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: SearchResponse = body_json(resp).await;
    assert_eq!(body.results.len(), 1);
    assert_eq!(body.results[0].entry.id, target);
    assert!((body.results[0].similarity - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn test_search_results_are_ordered() {
    let app = make_app();
    for i in 0..5 {
        add(&app, &format!("highlight number {}", i), "A", None).await;
    }

    let resp = app
        .oneshot(post_json("/search", json!({ "query": "highlight" })))
        .await
        .unwrap();
    let body: SearchResponse = body_json(resp).await;
    assert_eq!(body.results.len(), 5);
    for pair in body.results.windows(2) {
        assert!(pair[0].similarity >= pair[1].similarity);
    }
}

#[tokio::test]
async fn test_search_empty_store() {
    let app = make_app();
    let resp = app
        .oneshot(post_json("/search", json!({ "query": "anything" })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: SearchResponse = body_json(resp).await;
    assert!(body.results.is_empty());
}

#[tokio::test]
async fn test_search_validation() {
    let app = make_app();
    let resp = app
        .clone()
        .oneshot(post_json("/search", json!({ "query": "" })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .oneshot(post_json("/search", json!({ "query": "x", "limit": 0 })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// Joins
// =============================================================================

#[tokio::test]
async fn test_join_and_neighbors() {
    let app = make_app();
    let a = add(&app, "alpha", "A", None).await;
    let b = add(&app, "beta", "B", None).await;
    let c = add(&app, "gamma", "C", None).await;

    let resp = join(&app, &a.to_string(), &b.to_string()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: JoinResponse = body_json(resp).await;
    assert!(body.success);
    assert_eq!(body.joined, [a, b]);

    let resp = join(&app, &a.to_string(), &c.to_string()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(get(&format!("/entries/{}/neighbors", a)))
        .await
        .unwrap();
    let body: Value = body_json(resp).await;
    let ids: Vec<&str> = body["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![b.to_string(), c.to_string()]);

    let resp = app
        .oneshot(get(&format!("/entries/{}", b)))
        .await
        .unwrap();
    let body: EntryResponse = body_json(resp).await;
    assert_eq!(body.entry.metadata.joins, vec![a]);
}

#[tokio::test]
async fn test_join_twice_is_idempotent() {
    let app = make_app();
    let a = add(&app, "alpha", "A", None).await;
    let b = add(&app, "beta", "B", None).await;

    for _ in 0..2 {
        let resp = join(&app, &a.to_string(), &b.to_string()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = app
        .oneshot(get(&format!("/entries/{}", a)))
        .await
        .unwrap();
    let body: EntryResponse = body_json(resp).await;
    assert_eq!(body.entry.metadata.joins, vec![b]);
}

#[tokio::test]
async fn test_join_errors() {
    let app = make_app();
    let a = add(&app, "alpha", "A", None).await;

    let resp = join(&app, &a.to_string(), &a.to_string()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = join(&app, &a.to_string(), &Uuid::new_v4().to_string()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = join(&app, &a.to_string(), "zzz").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_neighbors_unknown_entry() {
    let app = make_app();
    let resp = app
        .oneshot(get(&format!("/entries/{}/neighbors", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

// =============================================================================
// Graph
// =============================================================================

#[tokio::test]
async fn test_graph_empty() {
    let app = make_app();
    let resp = app.oneshot(get("/graph")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = body_json(resp).await;
    assert!(body["nodes"].as_array().unwrap().is_empty());
    assert!(body["edges"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_graph_nodes_and_edges() {
    let app = make_app();
    let a = add(&app, "alpha", "A", None).await;
    let b = add(&app, "beta", "B", None).await;
    add(&app, "gamma", "C", None).await;
    join(&app, &a.to_string(), &b.to_string()).await;

    let resp = app.oneshot(get("/graph")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = body_json(resp).await;

    let nodes = body["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 3);
    for node in nodes {
        assert!(node["x"].as_f64().unwrap().is_finite());
        assert!(node["y"].as_f64().unwrap().is_finite());
        assert!(node["entry"].get("embedding").is_none());
    }

    let edges = body["edges"].as_array().unwrap();
    assert_eq!(edges.len(), 1);
    let pair = [
        edges[0]["source"].as_str().unwrap().to_string(),
        edges[0]["target"].as_str().unwrap().to_string(),
    ];
    assert!(pair.contains(&a.to_string()) && pair.contains(&b.to_string()));
}

#[tokio::test]
async fn test_graph_pair_layout() {
    let app = make_app();
    add(&app, "alpha", "A", None).await;
    add(&app, "beta", "B", None).await;

    let resp = app.oneshot(get("/graph")).await.unwrap();
    let body: Value = body_json(resp).await;
    let mut xs: Vec<f64> = body["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["x"].as_f64().unwrap())
        .collect();
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(xs, vec![-1.0, 1.0]);
}

#[tokio::test]
async fn test_graph_limit() {
    let app = make_app();
    for i in 0..4 {
        add(&app, &format!("entry {}", i), "A", None).await;
    }
    let resp = app.oneshot(get("/graph?limit=1")).await.unwrap();
    let body: Value = body_json(resp).await;
    let nodes = body["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["x"], 0.0);
    assert_eq!(nodes[0]["y"], 0.0);
}

#[tokio::test]
async fn test_graph_limit_all_and_invalid() {
    let app = make_app();
    for i in 0..3 {
        add(&app, &format!("entry {}", i), "A", None).await;
    }

    let resp = app.clone().oneshot(get("/graph?limit=all")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = body_json(resp).await;
    assert_eq!(body["nodes"].as_array().unwrap().len(), 3);

    let resp = app.oneshot(get("/graph?limit=abc")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = body_json(resp).await;
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn test_graph_time_budget_exceeded() {
    // validate() rejects a zero budget; set it directly to force the timeout.
    let mut config = test_config();
    config.layout.timeout_secs = 0;
    let app = create_router(make_state(config));
    for i in 0..60 {
        add(&app, &format!("highlight {}", i), "A", None).await;
    }

    let resp = app.oneshot(get("/graph")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    let body: Value = body_json(resp).await;
    assert_eq!(body["error"], "timeout");
}

// =============================================================================
// Index
// =============================================================================

#[tokio::test]
async fn test_rebuild_index() {
    let app = make_app();
    for i in 0..3 {
        add(&app, &format!("entry {}", i), "A", None).await;
    }

    let resp = app
        .oneshot(Request::post("/index/rebuild").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: RebuildResponse = body_json(resp).await;
    assert_eq!(body.indexed, 3);
    assert!(!body.approximate);
}
