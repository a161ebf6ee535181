//! Marginalia API crate - axum HTTP server and route handlers.
//!
//! Exposes entry ingestion, listing, similarity search, joins and the
//! projected connection graph as a JSON REST API.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
