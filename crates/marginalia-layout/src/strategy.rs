//! Layout strategy selection.
//!
//! Each strategy places a set of valid embeddings; which one runs depends
//! only on how many there are. `Circle` is never selected up front: it is
//! the fallback when `Manifold` turns out to be degenerate.

use std::f64::consts::TAU;
use std::sync::atomic::AtomicBool;

use serde::Serialize;

use crate::error::LayoutError;
use crate::umap::{self, ManifoldParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutStrategy {
    /// Nothing to place.
    Empty,
    /// A lone point at the origin.
    Origin,
    /// Two points at (-1, 0) and (1, 0).
    Pair,
    /// UMAP-style reduction.
    Manifold,
    /// Evenly spaced on the unit circle.
    Circle,
}

impl LayoutStrategy {
    /// The strategy for `count` valid embeddings.
    pub fn for_count(count: usize) -> Self {
        match count {
            0 => Self::Empty,
            1 => Self::Origin,
            2 => Self::Pair,
            _ => Self::Manifold,
        }
    }

    /// Place `vectors`, one coordinate per vector, in input order.
    pub fn place(
        self,
        vectors: &[Vec<f32>],
        params: &ManifoldParams,
        cancel: &AtomicBool,
    ) -> Result<Vec<[f64; 2]>, LayoutError> {
        match self {
            Self::Empty => Ok(Vec::new()),
            Self::Origin => Ok(vec![[0.0, 0.0]; vectors.len()]),
            Self::Pair => match vectors.len() {
                2 => Ok(vec![[-1.0, 0.0], [1.0, 0.0]]),
                n => Err(LayoutError::Degenerate(format!(
                    "pair layout needs 2 points, got {}",
                    n
                ))),
            },
            Self::Manifold => umap::reduce(vectors, params, cancel),
            Self::Circle => Ok(circle(vectors.len(), 1.0)),
        }
    }
}

/// `count` points evenly spaced on a circle of `radius`, starting at angle 0.
pub fn circle(count: usize, radius: f64) -> Vec<[f64; 2]> {
    (0..count)
        .map(|i| {
            let angle = TAU * i as f64 / count as f64;
            [radius * angle.cos(), radius * angle.sin()]
        })
        .collect()
}
