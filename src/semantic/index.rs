//! Records and their embeddings, held in memory for k-nearest lookups.
//!
//! Similarity is cosine. Norms are computed once at insertion, so a query
//! costs one dot product per record.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::semantic::EmailRecord;

#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub record: EmailRecord,
    pub embedding: Vec<f32>,
    norm: f32,
}

/// A record close to the query, borrowed from the index.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor<'a> {
    pub id: u64,
    /// Cosine similarity, -1.0 to 1.0
    pub score: f32,
    pub record: &'a EmailRecord,
}

/// Id-ordered collection of embedded records, all of one dimension.
pub struct VectorIndex {
    entries: BTreeMap<u64, VectorEntry>,
    dimensions: usize,
}

impl VectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a record under `id`, replacing any previous one.
    ///
    /// Zero vectors have no direction and are refused, as are vectors of
    /// the wrong dimension.
    pub fn insert(
        &mut self,
        id: u64,
        record: EmailRecord,
        embedding: Vec<f32>,
    ) -> Result<(), IndexError> {
        let norm = self.checked_norm(&embedding)?;
        self.entries.insert(
            id,
            VectorEntry {
                record,
                embedding,
                norm,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<&VectorEntry> {
        self.entries.get(&id)
    }

    /// Entries in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &VectorEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    /// The `k` records most similar to `query`, best first. Ties go to the
    /// lower id.
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor<'_>>, IndexError> {
        let query_norm = self.checked_norm(query)?;
        if k == 0 {
            return Ok(vec![]);
        }

        let mut neighbors: Vec<Neighbor<'_>> = self
            .iter()
            .map(|(id, entry)| Neighbor {
                id,
                score: dot(query, &entry.embedding) / (query_norm * entry.norm),
                record: &entry.record,
            })
            .collect();

        let by_score = |a: &Neighbor<'_>, b: &Neighbor<'_>| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        };

        if neighbors.len() > k {
            neighbors.select_nth_unstable_by(k - 1, by_score);
            neighbors.truncate(k);
        }
        neighbors.sort_by(by_score);

        Ok(neighbors)
    }

    fn checked_norm(&self, vector: &[f32]) -> Result<f32, IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }

        let norm = dot(vector, vector).sqrt();
        if norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }
        Ok(norm)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(subject: &str) -> EmailRecord {
        EmailRecord {
            subject: subject.to_string(),
            ..Default::default()
        }
    }

    fn ids(neighbors: &[Neighbor<'_>]) -> Vec<u64> {
        neighbors.iter().map(|n| n.id).collect()
    }

    #[test]
    fn test_insert_and_get() {
        let mut index = VectorIndex::new(3);
        assert!(index.is_empty());

        index.insert(1, record("hello"), vec![1.0, 0.0, 0.0]).unwrap();

        assert_eq!(index.len(), 1);
        let entry = index.get(1).unwrap();
        assert_eq!(entry.record.subject, "hello");
        assert_eq!(entry.embedding, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_insert_replaces_same_id() {
        let mut index = VectorIndex::new(2);
        index.insert(7, record("old"), vec![1.0, 0.0]).unwrap();
        index.insert(7, record("new"), vec![0.0, 1.0]).unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(7).unwrap().record.subject, "new");
    }

    #[test]
    fn test_insert_rejects_bad_vectors() {
        let mut index = VectorIndex::new(3);
        assert!(matches!(
            index.insert(1, record("x"), vec![1.0, 0.0, 0.0, 0.0]),
            Err(IndexError::DimensionMismatch { expected: 3, got: 4 })
        ));
        assert!(matches!(
            index.insert(1, record("x"), vec![0.0, 0.0, 0.0]),
            Err(IndexError::ZeroNormVector)
        ));
        assert!(index.is_empty());
    }

    #[test]
    fn test_nearest_first() {
        let mut index = VectorIndex::new(3);
        index.insert(1, record("far"), vec![0.0, 1.0, 0.0]).unwrap();
        index.insert(2, record("near"), vec![1.0, 0.1, 0.0]).unwrap();
        index.insert(3, record("middle"), vec![1.0, 1.0, 0.0]).unwrap();

        let neighbors = index.nearest(&[1.0, 0.0, 0.0], 10).unwrap();

        assert_eq!(ids(&neighbors), vec![2, 3, 1]);
        assert_eq!(neighbors[0].record.subject, "near");
        assert!(neighbors.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_scale_does_not_matter() {
        let mut index = VectorIndex::new(2);
        index.insert(1, record("short"), vec![0.1, 0.0]).unwrap();
        index.insert(2, record("long"), vec![50.0, 50.0]).unwrap();

        let neighbors = index.nearest(&[3.0, 0.0], 2).unwrap();
        assert_eq!(ids(&neighbors), vec![1, 2]);
        assert!((neighbors[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ties_prefer_lower_id() {
        let mut index = VectorIndex::new(2);
        for id in [9, 4, 6] {
            index.insert(id, record("same"), vec![1.0, 1.0]).unwrap();
        }

        assert_eq!(ids(&index.nearest(&[1.0, 1.0], 3).unwrap()), vec![4, 6, 9]);
        assert_eq!(ids(&index.nearest(&[1.0, 1.0], 2).unwrap()), vec![4, 6]);
    }

    #[test]
    fn test_nearest_respects_k() {
        let mut index = VectorIndex::new(3);
        for i in 0..10 {
            index
                .insert(i, record("x"), vec![1.0, i as f32 * 0.1, 0.0])
                .unwrap();
        }

        for k in [0, 1, 3, 10, 25] {
            let neighbors = index.nearest(&[1.0, 0.0, 0.0], k).unwrap();
            assert_eq!(neighbors.len(), k.min(10));
        }
        // partial selection keeps the true best
        assert_eq!(ids(&index.nearest(&[1.0, 0.0, 0.0], 3).unwrap()), vec![0, 1, 2]);
    }

    #[test]
    fn test_nearest_rejects_bad_query() {
        let index = VectorIndex::new(3);
        assert!(matches!(
            index.nearest(&[1.0, 0.0], 3),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            index.nearest(&[0.0, 0.0, 0.0], 3),
            Err(IndexError::ZeroNormVector)
        ));
    }

    #[test]
    fn test_nearest_on_empty_index() {
        let index = VectorIndex::new(3);
        assert!(index.nearest(&[1.0, 0.0, 0.0], 3).unwrap().is_empty());
    }
}
