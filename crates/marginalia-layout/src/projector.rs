//! 2D projection of entries for graph visualization.

use std::sync::atomic::AtomicBool;

use serde::Serialize;
use tracing::{debug, info, warn};

use marginalia_core::config::LayoutConfig;
use marginalia_core::types::Entry;

use crate::error::LayoutError;
use crate::strategy::{circle, LayoutStrategy};
use crate::umap::ManifoldParams;

/// Radius of the ring holding entries whose embedding cannot be projected.
const INVALID_RING_RADIUS: f64 = 3.0;

/// An entry and its position in layout space.
#[derive(Debug, Clone, Serialize)]
pub struct PlacedEntry {
    pub entry: Entry,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectorConfig {
    /// Expected embedding length; 0 accepts any non-empty length.
    pub dimensions: usize,
    pub min_dist: f64,
    pub spread: f64,
    pub seed: u64,
}

impl ProjectorConfig {
    pub fn from_layout_config(layout: &LayoutConfig, dimensions: usize) -> Self {
        Self {
            dimensions,
            min_dist: layout.min_dist,
            spread: layout.spread,
            seed: layout.seed,
        }
    }
}

/// Maps entries to 2D coordinates. Holds no state between calls.
#[derive(Debug, Clone)]
pub struct LayoutProjector {
    config: ProjectorConfig,
}

impl LayoutProjector {
    pub fn new(config: ProjectorConfig) -> Self {
        Self { config }
    }

    /// Place every entry. Never fails; output order matches input order.
    pub fn project(&self, entries: Vec<Entry>) -> Vec<PlacedEntry> {
        let never = AtomicBool::new(false);
        let positions = self
            .positions(&entries, &never)
            .unwrap_or_else(|_| circle(entries.len(), 1.0));
        attach(entries, positions)
    }

    /// Like [`project`](Self::project), but gives up with `Cancelled` as
    /// soon as `cancel` is set. No partial layout is ever returned.
    pub fn project_cancellable(
        &self,
        entries: Vec<Entry>,
        cancel: &AtomicBool,
    ) -> Result<Vec<PlacedEntry>, LayoutError> {
        let positions = self.positions(&entries, cancel)?;
        Ok(attach(entries, positions))
    }

    fn positions(
        &self,
        entries: &[Entry],
        cancel: &AtomicBool,
    ) -> Result<Vec<[f64; 2]>, LayoutError> {
        match entries.len() {
            0 => return Ok(Vec::new()),
            1 => {
                debug!(strategy = ?LayoutStrategy::Origin, "Single entry placed at origin");
                return Ok(vec![[0.0, 0.0]]);
            }
            _ => {}
        }

        let mut valid_slots = Vec::new();
        let mut vectors = Vec::new();
        let mut invalid_slots = Vec::new();
        for (slot, entry) in entries.iter().enumerate() {
            match entry.embedding.as_ref().filter(|e| self.is_projectable(e)) {
                Some(embedding) => {
                    valid_slots.push(slot);
                    vectors.push(embedding.clone());
                }
                None => invalid_slots.push(slot),
            }
        }

        let strategy = LayoutStrategy::for_count(vectors.len());
        let params = ManifoldParams::for_size(
            vectors.len(),
            self.config.min_dist,
            self.config.spread,
            self.config.seed,
        );
        info!(
            ?strategy,
            valid = valid_slots.len(),
            invalid = invalid_slots.len(),
            "Projecting entries"
        );

        let placed = match strategy.place(&vectors, &params, cancel) {
            Ok(placed) => placed,
            Err(LayoutError::Cancelled) => return Err(LayoutError::Cancelled),
            Err(LayoutError::Degenerate(reason)) => {
                warn!(%reason, "Projection degenerate, falling back to circle layout");
                LayoutStrategy::Circle.place(&vectors, &params, cancel)?
            }
        };

        let mut positions = vec![[0.0, 0.0]; entries.len()];
        for (slot, position) in valid_slots.into_iter().zip(placed) {
            positions[slot] = position;
        }
        let ring = circle(invalid_slots.len(), INVALID_RING_RADIUS);
        for (slot, position) in invalid_slots.into_iter().zip(ring) {
            positions[slot] = position;
        }
        Ok(positions)
    }

    fn is_projectable(&self, embedding: &[f32]) -> bool {
        !embedding.is_empty()
            && (self.config.dimensions == 0 || embedding.len() == self.config.dimensions)
            && embedding.iter().all(|v| v.is_finite())
    }
}

fn attach(entries: Vec<Entry>, positions: Vec<[f64; 2]>) -> Vec<PlacedEntry> {
    entries
        .into_iter()
        .zip(positions)
        .map(|(entry, [x, y])| PlacedEntry { entry, x, y })
        .collect()
}
