//! Marginalia Layout crate - 2D projection of entry embeddings.
//!
//! Chooses a layout strategy from the number of projectable embeddings
//! (empty, origin, pair, UMAP-style manifold), falls back to a circle when
//! the reduction is degenerate, and parks entries with unusable embeddings
//! on an outer ring so they stay visible.

pub mod error;
pub mod projector;
pub mod strategy;
pub mod umap;

pub use error::LayoutError;
pub use projector::{LayoutProjector, PlacedEntry, ProjectorConfig};
pub use strategy::LayoutStrategy;
