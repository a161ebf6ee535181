//! In-memory cosine similarity index.
//!
//! Small collections are searched exhaustively. Once a rebuild sees more
//! vectors than `exact_threshold`, the index trains an inverted-file layout
//! (spherical k-means over unit vectors) and queries only scan the
//! `n_probes` lists whose centroids are closest to the query.
//!
//! The index is derived state: it can always be rebuilt from the entry
//! store, and inserts made while a rebuild is training are carried over
//! when the new layout is swapped in.

use std::collections::HashMap;
use std::sync::RwLock;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use marginalia_core::config::SearchConfig;
use marginalia_core::error::MarginaliaError;
use marginalia_core::types::StoredVector;

const MAX_KMEANS_ITERATIONS: usize = 20;

/// Index tuning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    pub dimensions: usize,
    /// Collections at or below this size are always searched exactly.
    pub exact_threshold: usize,
    /// Number of inverted lists; 0 picks `sqrt(n)`.
    pub n_lists: usize,
    /// Lists scanned per query.
    pub n_probes: usize,
    pub seed: u64,
}

impl IndexConfig {
    pub fn from_search_config(search: &SearchConfig, dimensions: usize) -> Self {
        Self {
            dimensions,
            exact_threshold: search.exact_search_threshold,
            n_lists: search.ivf_lists,
            n_probes: search.ivf_probes.max(1),
            seed: 0x6d61_7267,
        }
    }

    /// Exact search only, whatever the collection size.
    pub fn exact(dimensions: usize) -> Self {
        Self {
            dimensions,
            exact_threshold: usize::MAX,
            n_lists: 0,
            n_probes: 1,
            seed: 0,
        }
    }
}

/// A single hit returned from a similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: Uuid,
    pub seq: i64,
    /// Cosine similarity in [-1, 1].
    pub similarity: f64,
}

/// Shape of the index, reported after rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub vectors: usize,
    pub lists: usize,
    pub approximate: bool,
}

#[derive(Debug, Clone)]
struct IndexedVector {
    id: Uuid,
    seq: i64,
    /// Unit-length copy of the embedding in f64; all zeros for a zero vector.
    unit: Vec<f64>,
}

#[derive(Debug, Default)]
struct Partitions {
    centroids: Vec<Vec<f64>>,
    /// Positions into `IndexState::vectors`, one list per centroid.
    lists: Vec<Vec<usize>>,
}

#[derive(Debug, Default)]
struct IndexState {
    vectors: Vec<IndexedVector>,
    positions: HashMap<Uuid, usize>,
    partitions: Option<Partitions>,
}

impl IndexState {
    fn upsert(&mut self, vector: IndexedVector) {
        if let Some(&pos) = self.positions.get(&vector.id) {
            // Re-inserting an id keeps its list assignment.
            self.vectors[pos] = vector;
            return;
        }
        let pos = self.vectors.len();
        if let Some(partitions) = self.partitions.as_mut() {
            let list = nearest_centroid(&partitions.centroids, &vector.unit);
            partitions.lists[list].push(pos);
        }
        self.positions.insert(vector.id, pos);
        self.vectors.push(vector);
    }
}

/// Thread-safe similarity index over entry embeddings.
#[derive(Debug)]
pub struct SimilarityIndex {
    config: IndexConfig,
    state: RwLock<IndexState>,
}

impl SimilarityIndex {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Add one vector. An id that is already indexed is overwritten.
    pub fn insert(&self, vector: StoredVector) -> Result<(), MarginaliaError> {
        let indexed = self.prepare(vector)?;
        let mut state = self
            .state
            .write()
            .map_err(|e| MarginaliaError::Storage(format!("Index lock poisoned: {}", e)))?;
        state.upsert(indexed);
        Ok(())
    }

    /// Replace the index contents with `vectors`, retraining the list
    /// layout when the collection is large enough.
    pub fn rebuild(&self, vectors: Vec<StoredVector>) -> Result<IndexStats, MarginaliaError> {
        let mut fresh = IndexState::default();
        for vector in vectors {
            fresh.upsert(self.prepare(vector)?);
        }

        if fresh.vectors.len() > self.config.exact_threshold {
            fresh.partitions = Some(self.train(&fresh.vectors));
        }

        let mut state = self
            .state
            .write()
            .map_err(|e| MarginaliaError::Storage(format!("Index lock poisoned: {}", e)))?;

        // Carry over anything inserted while the new layout was training.
        let carried: Vec<IndexedVector> = state
            .vectors
            .iter()
            .filter(|v| !fresh.positions.contains_key(&v.id))
            .cloned()
            .collect();
        let carried_count = carried.len();
        for vector in carried {
            fresh.upsert(vector);
        }

        *state = fresh;
        let stats = stats_of(&state);
        info!(
            vectors = stats.vectors,
            lists = stats.lists,
            approximate = stats.approximate,
            carried = carried_count,
            "Similarity index rebuilt"
        );
        Ok(stats)
    }

    /// The `k` most similar vectors to `query`, most similar first.
    ///
    /// Equal similarities are ordered newest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, MarginaliaError> {
        if k == 0 {
            return Err(MarginaliaError::Validation(
                "limit must be at least 1".to_string(),
            ));
        }
        self.check_vector(query)?;

        let query = normalized(query);
        let state = self
            .state
            .read()
            .map_err(|e| MarginaliaError::Storage(format!("Index lock poisoned: {}", e)))?;

        if state.vectors.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = match &state.partitions {
            None => state
                .vectors
                .iter()
                .map(|v| hit_for(v, &query))
                .collect(),
            Some(partitions) => {
                let probes = probe_order(&partitions.centroids, &query, self.config.n_probes);
                debug!(probes = probes.len(), "Probing inverted lists");
                probes
                    .into_iter()
                    .flat_map(|list| partitions.lists[list].iter())
                    .map(|&pos| hit_for(&state.vectors[pos], &query))
                    .collect()
            }
        };

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.seq.cmp(&a.seq))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.vectors.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether queries currently scan a subset of the lists.
    pub fn is_approximate(&self) -> bool {
        self.state
            .read()
            .map(|s| s.partitions.is_some())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> IndexStats {
        self.state
            .read()
            .map(|s| stats_of(&s))
            .unwrap_or(IndexStats {
                vectors: 0,
                lists: 0,
                approximate: false,
            })
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), MarginaliaError> {
        if vector.len() != self.config.dimensions {
            return Err(MarginaliaError::Validation(format!(
                "vector has {} dimensions, expected {}",
                vector.len(),
                self.config.dimensions
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(MarginaliaError::Validation(
                "vector contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }

    fn prepare(&self, vector: StoredVector) -> Result<IndexedVector, MarginaliaError> {
        self.check_vector(&vector.embedding)?;
        Ok(IndexedVector {
            id: vector.id,
            seq: vector.seq,
            unit: normalized(&vector.embedding),
        })
    }

    /// Spherical k-means with k-means++ seeding.
    fn train(&self, vectors: &[IndexedVector]) -> Partitions {
        let n = vectors.len();
        let k = match self.config.n_lists {
            0 => (n as f64).sqrt().round() as usize,
            lists => lists,
        }
        .clamp(1, n);

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut centroids = kmeans_plus_plus_init(vectors, k, &mut rng);
        let mut assignments = vec![usize::MAX; n];

        for iteration in 0..MAX_KMEANS_ITERATIONS {
            let mut changed = 0usize;
            for (i, vector) in vectors.iter().enumerate() {
                let nearest = nearest_centroid(&centroids, &vector.unit);
                if assignments[i] != nearest {
                    assignments[i] = nearest;
                    changed += 1;
                }
            }
            if changed == 0 {
                debug!(iteration, "k-means converged");
                break;
            }
            recompute_centroids(vectors, &assignments, &mut centroids);
        }

        // Final pass so every vector sits in the list of its nearest final centroid.
        let mut lists = vec![Vec::new(); centroids.len()];
        for (pos, vector) in vectors.iter().enumerate() {
            lists[nearest_centroid(&centroids, &vector.unit)].push(pos);
        }
        Partitions { centroids, lists }
    }
}

fn stats_of(state: &IndexState) -> IndexStats {
    IndexStats {
        vectors: state.vectors.len(),
        lists: state
            .partitions
            .as_ref()
            .map(|p| p.centroids.len())
            .unwrap_or(0),
        approximate: state.partitions.is_some(),
    }
}

fn hit_for(vector: &IndexedVector, query: &[f64]) -> SearchHit {
    SearchHit {
        id: vector.id,
        seq: vector.seq,
        similarity: dot(&vector.unit, query).clamp(-1.0, 1.0),
    }
}

/// Unit-length f64 copy of `v`. A zero vector stays zero, so it scores 0
/// against everything. Near-duplicates differ below f32 resolution once
/// normalized, so the copy must stay f64.
fn normalized(v: &[f32]) -> Vec<f64> {
    unit_length(v.iter().map(|x| *x as f64).collect())
}

fn unit_length(mut v: Vec<f64>) -> Vec<f64> {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm == 0.0 {
        return v;
    }
    for x in &mut v {
        *x /= norm;
    }
    v
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn nearest_centroid(centroids: &[Vec<f64>], unit: &[f64]) -> usize {
    let mut best = 0;
    let mut best_score = f64::NEG_INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let score = dot(centroid, unit);
        if score > best_score {
            best = i;
            best_score = score;
        }
    }
    best
}

/// Centroid indices ordered by closeness to `query`, cut to `n_probes`.
fn probe_order(centroids: &[Vec<f64>], query: &[f64], n_probes: usize) -> Vec<usize> {
    let mut scored: Vec<(usize, f64)> = centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, dot(c, query)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(n_probes.max(1));
    scored.into_iter().map(|(i, _)| i).collect()
}

/// Pick `k` starting centroids, each new one with probability proportional
/// to its squared cosine distance from the closest centroid so far.
fn kmeans_plus_plus_init(vectors: &[IndexedVector], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let n = vectors.len();
    let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
    centroids.push(vectors[rng.random_range(0..n)].unit.clone());

    let mut min_distances = vec![f64::MAX; n];
    while centroids.len() < k {
        let last = &centroids[centroids.len() - 1];
        for (i, vector) in vectors.iter().enumerate() {
            let distance = (1.0 - dot(&vector.unit, last)).max(0.0).powi(2);
            if distance < min_distances[i] {
                min_distances[i] = distance;
            }
        }

        let total: f64 = min_distances.iter().sum();
        if total <= f64::EPSILON {
            // Every point coincides with a centroid already.
            break;
        }

        let mut target = rng.random::<f64>() * total;
        let mut chosen = n - 1;
        for (i, &d) in min_distances.iter().enumerate() {
            if target < d {
                chosen = i;
                break;
            }
            target -= d;
        }
        centroids.push(vectors[chosen].unit.clone());
    }

    centroids
}

/// Mean direction of each list's members. Empty lists keep their centroid.
fn recompute_centroids(vectors: &[IndexedVector], assignments: &[usize], centroids: &mut [Vec<f64>]) {
    let dims = centroids.first().map(Vec::len).unwrap_or(0);
    let mut sums = vec![vec![0.0f64; dims]; centroids.len()];
    let mut counts = vec![0usize; centroids.len()];

    for (vector, &list) in vectors.iter().zip(assignments) {
        counts[list] += 1;
        for (sum, x) in sums[list].iter_mut().zip(&vector.unit) {
            *sum += x;
        }
    }

    for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
        if count == 0 {
            continue;
        }
        let mean: Vec<f64> = sum.iter().map(|s| s / count as f64).collect();
        let unit = unit_length(mean);
        if unit.iter().any(|x| *x != 0.0) {
            *centroid = unit;
        }
    }
}
