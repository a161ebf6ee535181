//! UMAP-style reduction of embeddings to two dimensions.
//!
//! The reduction follows the usual three stages:
//!
//! 1. **Neighbor graph.** Exact k-nearest neighbors under cosine distance,
//!    turned into fuzzy memberships with a per-point bandwidth (`sigma`)
//!    and local connectivity offset (`rho`), then symmetrized with the
//!    probabilistic union `a + b - a*b`.
//! 2. **Curve fit.** The low-dimensional similarity `1 / (1 + a*d^(2b))`
//!    is fitted to the target shape set by `min_dist` and `spread`.
//! 3. **Layout optimization.** Stochastic gradient descent over graph
//!    edges, sampled in proportion to their weight, with attractive moves
//!    along edges and repulsive moves against random negative samples.
//!
//! Everything random is drawn from a `StdRng` seeded by the caller, so a
//! given input and seed always produce the same coordinates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::LayoutError;

const GRADIENT_CLIP: f64 = 4.0;
const INIT_RANGE: f64 = 10.0;
const SMOOTH_K_ITERATIONS: usize = 64;
const SMOOTH_K_TOLERANCE: f64 = 1e-5;
const MIN_K_DIST_SCALE: f64 = 1e-3;
const CURVE_SAMPLES: usize = 300;

/// Parameters of one reduction run.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifoldParams {
    /// Neighborhood size, counting the point itself.
    pub n_neighbors: usize,
    pub n_epochs: usize,
    pub min_dist: f64,
    pub spread: f64,
    pub learning_rate: f64,
    /// Negative samples drawn per positive edge sample.
    pub negative_sample_rate: usize,
    pub seed: u64,
}

impl ManifoldParams {
    /// Parameters scaled to a collection of `n` points.
    ///
    /// Neighborhoods grow with the collection, `min(8, max(2, floor(0.1n)))`,
    /// and the epoch count is `2n` bounded to `[50, 100]`.
    pub fn for_size(n: usize, min_dist: f64, spread: f64, seed: u64) -> Self {
        let n_neighbors = ((n as f64 * 0.1).floor() as usize).clamp(2, 8);
        let n_epochs = n.saturating_mul(2).clamp(50, 100);
        Self {
            n_neighbors,
            n_epochs,
            min_dist,
            spread,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            seed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Edge {
    head: usize,
    tail: usize,
    weight: f64,
}

/// Reduce `data` to one 2D coordinate per row.
///
/// Fails with `Degenerate` when the input cannot produce a meaningful
/// layout (fewer than three points, no usable edges, non-finite output)
/// and with `Cancelled` as soon as `cancel` is observed set.
pub fn reduce(
    data: &[Vec<f32>],
    params: &ManifoldParams,
    cancel: &AtomicBool,
) -> Result<Vec<[f64; 2]>, LayoutError> {
    let n = data.len();
    if n < 3 {
        return Err(LayoutError::Degenerate(format!(
            "need at least 3 points, got {}",
            n
        )));
    }
    if params.n_epochs == 0 {
        return Err(LayoutError::Degenerate("zero epochs".to_string()));
    }

    let k = params.n_neighbors.saturating_sub(1).clamp(1, n - 1);
    let knn = nearest_neighbors(data, k, cancel)?;
    let graph = fuzzy_union(&knn, k);
    if graph.is_empty() {
        return Err(LayoutError::Degenerate("empty neighbor graph".to_string()));
    }

    let (a, b) = find_ab_params(params.spread, params.min_dist);
    debug!(points = n, neighbors = k, edges = graph.len(), a, b, "Manifold graph built");

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut embedding: Vec<[f64; 2]> = (0..n)
        .map(|_| {
            [
                rng.random_range(-INIT_RANGE..INIT_RANGE),
                rng.random_range(-INIT_RANGE..INIT_RANGE),
            ]
        })
        .collect();

    optimize(&mut embedding, &graph, a, b, params, &mut rng, cancel)?;

    if embedding
        .iter()
        .any(|p| !p[0].is_finite() || !p[1].is_finite())
    {
        return Err(LayoutError::Degenerate(
            "optimization produced non-finite coordinates".to_string(),
        ));
    }
    Ok(embedding)
}

fn check_cancel(cancel: &AtomicBool) -> Result<(), LayoutError> {
    if cancel.load(Ordering::Relaxed) {
        return Err(LayoutError::Cancelled);
    }
    Ok(())
}

fn unit(v: &[f32]) -> Vec<f64> {
    let norm = v.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm == 0.0 {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| *x as f64 / norm).collect()
}

/// Exact k nearest neighbors of every row under cosine distance,
/// nearest first. Ties go to the lower index.
fn nearest_neighbors(
    data: &[Vec<f32>],
    k: usize,
    cancel: &AtomicBool,
) -> Result<Vec<Vec<(usize, f64)>>, LayoutError> {
    let units: Vec<Vec<f64>> = data.iter().map(|v| unit(v)).collect();
    let mut knn = Vec::with_capacity(units.len());

    for (i, row) in units.iter().enumerate() {
        check_cancel(cancel)?;
        let mut distances: Vec<(usize, f64)> = units
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(j, other)| {
                let dot: f64 = row.iter().zip(other).map(|(x, y)| x * y).sum();
                (j, (1.0 - dot).max(0.0))
            })
            .collect();

        if distances.iter().any(|(_, d)| !d.is_finite()) {
            return Err(LayoutError::Degenerate(
                "non-finite distance in neighbor search".to_string(),
            ));
        }

        distances.sort_by(|x, y| {
            x.1.partial_cmp(&y.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(x.0.cmp(&y.0))
        });
        distances.truncate(k);
        knn.push(distances);
    }
    Ok(knn)
}

/// Local connectivity offset and bandwidth for one point's neighbor distances.
///
/// `rho` is the distance to the nearest distinct neighbor; `sigma` is
/// chosen by bisection so that the memberships sum to `log2(k + 1)`.
fn smooth_knn_dist(distances: &[f64], k: usize, mean_all: f64) -> (f64, f64) {
    let target = ((k + 1) as f64).log2();
    let rho = distances.iter().copied().find(|d| *d > 0.0).unwrap_or(0.0);

    let mut lo = 0.0;
    let mut hi = f64::INFINITY;
    let mut mid = 1.0;
    for _ in 0..SMOOTH_K_ITERATIONS {
        let psum: f64 = distances
            .iter()
            .map(|d| {
                let excess = d - rho;
                if excess > 0.0 {
                    (-excess / mid).exp()
                } else {
                    1.0
                }
            })
            .sum();

        if (psum - target).abs() < SMOOTH_K_TOLERANCE {
            break;
        }
        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            mid = if hi.is_infinite() { mid * 2.0 } else { (lo + hi) / 2.0 };
        }
    }

    let mean_local = distances.iter().sum::<f64>() / distances.len().max(1) as f64;
    let floor = if rho > 0.0 { mean_local } else { mean_all } * MIN_K_DIST_SCALE;
    (rho, mid.max(floor))
}

/// Directed fuzzy memberships, symmetrized with the probabilistic union.
/// Each undirected edge appears once, head < tail, in index order.
fn fuzzy_union(knn: &[Vec<(usize, f64)>], k: usize) -> Vec<Edge> {
    let total: f64 = knn.iter().flatten().map(|(_, d)| d).sum();
    let count = knn.iter().map(Vec::len).sum::<usize>().max(1);
    let mean_all = total / count as f64;

    let mut directed: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for (i, neighbors) in knn.iter().enumerate() {
        let distances: Vec<f64> = neighbors.iter().map(|(_, d)| *d).collect();
        let (rho, sigma) = smooth_knn_dist(&distances, k, mean_all);
        for &(j, d) in neighbors {
            let excess = d - rho;
            let weight = if excess <= 0.0 || sigma == 0.0 {
                1.0
            } else {
                (-excess / sigma).exp()
            };
            directed.insert((i, j), weight);
        }
    }

    let mut undirected: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for (&(i, j), &w) in &directed {
        let key = (i.min(j), i.max(j));
        if undirected.contains_key(&key) {
            continue;
        }
        let back = directed.get(&(j, i)).copied().unwrap_or(0.0);
        undirected.insert(key, w + back - w * back);
    }

    undirected
        .into_iter()
        .filter(|(_, w)| *w > 0.0 && w.is_finite())
        .map(|((head, tail), weight)| Edge { head, tail, weight })
        .collect()
}

/// Fit `a` and `b` of `1 / (1 + a*x^(2b))` to the target curve:
/// 1 up to `min_dist`, then `exp(-(x - min_dist) / spread)`.
///
/// Least squares by successively refined grid search.
pub fn find_ab_params(spread: f64, min_dist: f64) -> (f64, f64) {
    let xs: Vec<f64> = (0..CURVE_SAMPLES)
        .map(|i| spread * 3.0 * i as f64 / (CURVE_SAMPLES - 1) as f64)
        .collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|&x| {
            if x < min_dist {
                1.0
            } else {
                (-(x - min_dist) / spread).exp()
            }
        })
        .collect();

    let loss = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(&ys)
            .map(|(&x, &y)| {
                let fitted = 1.0 / (1.0 + a * x.powf(2.0 * b));
                (fitted - y).powi(2)
            })
            .sum()
    };

    // Search log(a) and b, narrowing the window around the best cell each round.
    let (mut log_a_lo, mut log_a_hi) = (-3.0f64, 3.0f64);
    let (mut b_lo, mut b_hi) = (0.1f64, 3.0f64);
    let mut best = (1.0, 1.0, f64::INFINITY);
    const STEPS: usize = 40;

    for _ in 0..4 {
        let a_step = (log_a_hi - log_a_lo) / STEPS as f64;
        let b_step = (b_hi - b_lo) / STEPS as f64;
        for ia in 0..=STEPS {
            let a = 10f64.powf(log_a_lo + a_step * ia as f64);
            for ib in 0..=STEPS {
                let b = b_lo + b_step * ib as f64;
                let l = loss(a, b);
                if l < best.2 {
                    best = (a, b, l);
                }
            }
        }
        let best_log_a = best.0.log10();
        log_a_lo = best_log_a - 2.0 * a_step;
        log_a_hi = best_log_a + 2.0 * a_step;
        b_lo = (best.1 - 2.0 * b_step).max(1e-3);
        b_hi = best.1 + 2.0 * b_step;
    }

    (best.0, best.1)
}

fn clip(v: f64) -> f64 {
    v.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}

fn optimize(
    embedding: &mut [[f64; 2]],
    graph: &[Edge],
    a: f64,
    b: f64,
    params: &ManifoldParams,
    rng: &mut StdRng,
    cancel: &AtomicBool,
) -> Result<(), LayoutError> {
    let n = embedding.len();
    let n_epochs = params.n_epochs as f64;
    let max_weight = graph.iter().map(|e| e.weight).fold(0.0, f64::max);

    // Edges too weak to be sampled even once are dropped.
    let edges: Vec<Edge> = graph
        .iter()
        .copied()
        .filter(|e| e.weight >= max_weight / n_epochs)
        .collect();
    let epochs_per_sample: Vec<f64> = edges.iter().map(|e| max_weight / e.weight).collect();
    let neg_rate = params.negative_sample_rate.max(1) as f64;
    let epochs_per_negative: Vec<f64> = epochs_per_sample.iter().map(|e| e / neg_rate).collect();
    let mut next_sample = epochs_per_sample.clone();
    let mut next_negative = epochs_per_negative.clone();

    for epoch in 0..params.n_epochs {
        check_cancel(cancel)?;
        let now = epoch as f64;
        let alpha = params.learning_rate * (1.0 - now / n_epochs);

        for (e, edge) in edges.iter().enumerate() {
            if next_sample[e] > now {
                continue;
            }

            let (j, k) = (edge.head, edge.tail);
            let mut current = embedding[j];
            let mut other = embedding[k];
            let diff = [current[0] - other[0], current[1] - other[1]];
            let dist_sq = diff[0] * diff[0] + diff[1] * diff[1];
            let attract = if dist_sq > 0.0 {
                -2.0 * a * b * dist_sq.powf(b - 1.0) / (a * dist_sq.powf(b) + 1.0)
            } else {
                0.0
            };
            for d in 0..2 {
                let grad = clip(attract * diff[d]);
                current[d] += grad * alpha;
                other[d] -= grad * alpha;
            }
            embedding[j] = current;
            embedding[k] = other;
            next_sample[e] += epochs_per_sample[e];

            let n_neg = ((now - next_negative[e]) / epochs_per_negative[e])
                .floor()
                .max(0.0) as usize;
            for _ in 0..n_neg {
                let sample = rng.random_range(0..n);
                if sample == j {
                    continue;
                }
                let other = embedding[sample];
                let diff = [current[0] - other[0], current[1] - other[1]];
                let dist_sq = diff[0] * diff[0] + diff[1] * diff[1];
                let repel = if dist_sq > 0.0 {
                    2.0 * b / ((0.001 + dist_sq) * (a * dist_sq.powf(b) + 1.0))
                } else {
                    0.0
                };
                for d in 0..2 {
                    let grad = if repel > 0.0 {
                        clip(repel * diff[d])
                    } else {
                        GRADIENT_CLIP
                    };
                    current[d] += grad * alpha;
                }
            }
            embedding[j] = current;
            next_negative[e] += n_neg as f64 * epochs_per_negative[e];
        }
    }
    Ok(())
}
