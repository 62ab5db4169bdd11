/// Vector index for chunk similarity search
///
/// The id -> vector map is authoritative and is what gets persisted. Below
/// `ann_threshold` live vectors, search is an exact cosine scan; above it an
/// HNSW graph is built over the map and kept in step with inserts. HNSW
/// cannot remove points, so deletions leave tombstones that are filtered at
/// query time until enough accumulate to warrant a rebuild.
use crate::config::IndexingConfig;
use ahash::{HashMap, HashMapExt};
use hnsw_rs::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Invalid vector: {0}")]
    InvalidVector(String),
}

/// Search result with ID and similarity score
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// Chunk id
    pub id: u64,
    /// Cosine similarity, higher is more similar
    pub score: f32,
}

const MAX_LAYER: usize = 16;

pub struct VectorIndex {
    dimension: usize,
    /// Unit-length vectors by chunk id
    vectors: HashMap<u64, Vec<f32>>,
    ann: Option<Hnsw<'static, f32, DistCosine>>,
    /// Ids removed from the map but still present in `ann`
    tombstones: usize,
    ann_threshold: usize,
    ef_construction: usize,
    ef_search: usize,
    m: usize,
}

impl VectorIndex {
    pub fn new(dimension: usize, config: &IndexingConfig) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
            ann: None,
            tombstones: 0,
            ann_threshold: config.ann_threshold,
            ef_construction: config.hnsw_ef_construction,
            ef_search: config.hnsw_ef_search,
            m: config.hnsw_m,
        }
    }

    /// Insert or replace the vector for `id`
    pub fn insert(&mut self, id: u64, vector: &[f32]) -> Result<(), VectorIndexError> {
        if vector.len() != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let data = normalize(vector).ok_or_else(|| {
            VectorIndexError::InvalidVector(format!("zero or non-finite vector for id {}", id))
        })?;

        if self.vectors.insert(id, data).is_some() && self.ann.is_some() {
            // The stale point stays in the graph; the fresh one is added below
            self.tombstones += 1;
        }

        if let Some(ann) = &self.ann {
            if let Some(data) = self.vectors.get(&id) {
                ann.insert((data, id as usize));
            }
        } else if self.vectors.len() > self.ann_threshold {
            self.rebuild_ann();
        }

        self.maybe_compact();
        Ok(())
    }

    /// Remove a vector. Returns false when the id was unknown.
    pub fn remove(&mut self, id: u64) -> bool {
        if self.vectors.remove(&id).is_none() {
            return false;
        }
        if self.ann.is_some() {
            self.tombstones += 1;
        }
        self.maybe_compact();
        true
    }

    /// k nearest chunks with similarity at or above `min_score`, best first
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<SearchResult>, VectorIndexError> {
        if query.len() != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 || self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        let Some(query) = normalize(query) else {
            return Ok(Vec::new());
        };

        let mut results: Vec<SearchResult> = match &self.ann {
            Some(ann) => {
                let wanted = k + self.tombstones;
                ann.search(&query, wanted, self.ef_search.max(wanted))
                    .into_iter()
                    .filter_map(|neighbor| {
                        let id = neighbor.d_id as u64;
                        // Rescore against the live vector so tombstoned and
                        // replaced points never leak through
                        self.vectors.get(&id).map(|v| SearchResult {
                            id,
                            score: dot(&query, v),
                        })
                    })
                    .collect()
            }
            None => self
                .vectors
                .iter()
                .map(|(id, v)| SearchResult {
                    id: *id,
                    score: dot(&query, v),
                })
                .collect(),
        };

        results.retain(|r| r.score >= min_score);
        results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        results.dedup_by_key(|r| r.id);
        results.truncate(k);
        Ok(results)
    }

    pub fn get(&self, id: u64) -> Option<&[f32]> {
        self.vectors.get(&id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn uses_ann(&self) -> bool {
        self.ann.is_some()
    }

    pub fn clear(&mut self) {
        self.vectors.clear();
        self.ann = None;
        self.tombstones = 0;
    }

    /// All (id, vector) pairs, for snapshots
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[f32])> {
        self.vectors.iter().map(|(id, v)| (*id, v.as_slice()))
    }

    fn maybe_compact(&mut self) {
        if self.ann.is_none() {
            return;
        }
        if self.vectors.len() <= self.ann_threshold {
            self.ann = None;
            self.tombstones = 0;
        } else if self.tombstones > self.vectors.len() / 2 {
            tracing::debug!(
                "Rebuilding HNSW graph: {} tombstones over {} live vectors",
                self.tombstones,
                self.vectors.len()
            );
            self.rebuild_ann();
        }
    }

    fn rebuild_ann(&mut self) {
        let capacity = (self.vectors.len() * 2).max(1024);
        let ann = Hnsw::<f32, DistCosine>::new(
            self.m,
            capacity,
            MAX_LAYER,
            self.ef_construction,
            DistCosine,
        );
        for (id, data) in &self.vectors {
            ann.insert((data, *id as usize));
        }
        self.ann = Some(ann);
        self.tombstones = 0;
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(vector: &[f32]) -> Option<Vec<f32>> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm == 0.0 {
        return None;
    }
    Some(vector.iter().map(|x| x / norm).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ann_threshold: usize) -> IndexingConfig {
        IndexingConfig {
            ann_threshold,
            ..Default::default()
        }
    }

    fn basis(dimension: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimension];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn test_exact_search_orders_by_similarity() {
        let mut index = VectorIndex::new(3, &config(100));
        index.insert(1, &[1.0, 0.0, 0.0]).unwrap();
        index.insert(2, &[0.7, 0.7, 0.0]).unwrap();
        index.insert(3, &[0.0, 0.0, 1.0]).unwrap();

        let results = index.search(&[1.0, 0.1, 0.0], 2, 0.0).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, 1);
        assert_eq!(results[1].id, 2);
        assert!(!index.uses_ann());
    }

    #[test]
    fn test_min_score_filters() {
        let mut index = VectorIndex::new(2, &config(100));
        index.insert(1, &[1.0, 0.0]).unwrap();
        index.insert(2, &[0.0, 1.0]).unwrap();

        let results = index.search(&[1.0, 0.0], 10, 0.5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 1);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = VectorIndex::new(3, &config(100));
        assert!(matches!(
            index.insert(1, &[1.0, 0.0]),
            Err(VectorIndexError::InvalidDimension { expected: 3, actual: 2 })
        ));
        assert!(index.search(&[1.0], 1, 0.0).is_err());
        assert!(index.insert(1, &[0.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn test_remove_and_replace() {
        let mut index = VectorIndex::new(2, &config(100));
        index.insert(1, &[1.0, 0.0]).unwrap();
        assert!(index.remove(1));
        assert!(!index.remove(1));
        assert!(index.search(&[1.0, 0.0], 5, 0.0).unwrap().is_empty());

        index.insert(2, &[1.0, 0.0]).unwrap();
        index.insert(2, &[0.0, 1.0]).unwrap();
        assert_eq!(index.len(), 1);
        let results = index.search(&[0.0, 1.0], 1, 0.0).unwrap();
        assert!((results[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_switches_to_ann_and_filters_tombstones() {
        let dimension = 8;
        let mut index = VectorIndex::new(dimension, &config(4));
        for id in 0..8u64 {
            let mut v = basis(dimension, id as usize);
            v[(id as usize + 1) % dimension] = 0.1;
            index.insert(id, &v).unwrap();
        }
        assert!(index.uses_ann());

        index.remove(3);
        let results = index.search(&basis(dimension, 3), 8, -1.0).unwrap();
        assert!(results.iter().all(|r| r.id != 3));

        // Falling back under the threshold drops the graph
        for id in [0, 1, 2, 4, 5] {
            index.remove(id);
        }
        assert!(!index.uses_ann());
        assert_eq!(index.len(), 2);
    }
}
