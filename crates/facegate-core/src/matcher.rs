//! Nearest-neighbour lookup of a probe embedding in the gallery.
//!
//! This is a linear scan, O(n·d) per query. It is intended for galleries of
//! hundreds to low thousands of records; an approximate index can replace it
//! behind the same [`Matcher`] trait.

use crate::types::{Embedding, FaceRecord, MatchResult};

/// Strategy for finding the closest enrolled identity.
pub trait Matcher {
    /// Return the best match whose similarity is `>= threshold`, or `None`.
    fn find_best_match(
        &self,
        query: &Embedding,
        gallery: &[FaceRecord],
        threshold: f32,
    ) -> Option<MatchResult>;
}

/// Cosine similarity matcher.
///
/// Always iterates every gallery entry. Ties keep the earliest record in
/// gallery (insertion) order.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn find_best_match(
        &self,
        query: &Embedding,
        gallery: &[FaceRecord],
        threshold: f32,
    ) -> Option<MatchResult> {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, record) in gallery.iter().enumerate() {
            if record.embedding.dim() != query.dim() {
                tracing::debug!(
                    record = %record.id,
                    expected = query.dim(),
                    found = record.embedding.dim(),
                    "skipping record with mismatched embedding dimension"
                );
                continue;
            }
            let sim = query.similarity(&record.embedding);
            // Strict comparison: the first of equal scores wins. NaN never wins.
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim >= threshold => Some(MatchResult {
                name: gallery[idx].name.clone(),
                confidence: best_sim,
                record_id: gallery[idx].id.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, name: &str, values: Vec<f32>) -> FaceRecord {
        FaceRecord {
            id: id.into(),
            name: name.into(),
            embedding: Embedding::new(values),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_best_match_is_found_anywhere_in_gallery() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            record("1", "decoy1", vec![0.0, 1.0, 0.0]),
            record("2", "decoy2", vec![0.0, 0.0, 1.0]),
            record("3", "match", vec![1.0, 0.0, 0.0]),
        ];

        let result = CosineMatcher.find_best_match(&probe, &gallery, 0.5).unwrap();
        assert_eq!(result.record_id, "3");
        assert_eq!(result.name, "match");
        assert!((result.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_below_threshold_is_none() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![record("1", "other", vec![0.0, 1.0, 0.0])];
        assert!(CosineMatcher.find_best_match(&probe, &gallery, 0.5).is_none());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![record("1", "same", vec![2.0, 0.0])];
        let sim = probe.similarity(&gallery[0].embedding);
        let result = CosineMatcher.find_best_match(&probe, &gallery, sim).unwrap();
        assert_eq!(result.name, "same");
    }

    #[test]
    fn test_empty_gallery() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        assert!(CosineMatcher.find_best_match(&probe, &[], -1.0).is_none());
    }

    #[test]
    fn test_tie_goes_to_first_inserted() {
        let probe = Embedding::new(vec![1.0, 1.0]);
        let gallery = vec![
            record("a", "first", vec![0.6, 0.8]),
            record("b", "second", vec![0.6, 0.8]),
            record("c", "third", vec![0.6, 0.8]),
        ];
        for _ in 0..10 {
            let result = CosineMatcher.find_best_match(&probe, &gallery, 0.9).unwrap();
            assert_eq!(result.name, "first");
        }
    }

    #[test]
    fn test_scale_invariance() {
        let probe = Embedding::new(vec![0.2, -0.7, 0.4, 0.1]);
        let gallery = vec![
            record("1", "alice", vec![0.25, -0.6, 0.35, 0.0]),
            record("2", "bob", vec![-0.3, 0.2, 0.9, 0.4]),
            record("3", "carol", vec![0.9, 0.1, -0.1, 0.2]),
        ];
        let base = CosineMatcher.find_best_match(&probe, &gallery, 0.6).unwrap();
        for k in [0.001f32, 0.5, 3.0, 1000.0] {
            let scaled = CosineMatcher
                .find_best_match(&probe.scaled(k), &gallery, 0.6)
                .unwrap();
            assert_eq!(scaled.name, base.name);
            assert!((scaled.confidence - base.confidence).abs() < 1e-5);
        }
    }

    #[test]
    fn test_mismatched_dimensions_are_skipped() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![
            record("1", "wrong-dim", vec![1.0, 0.0, 0.0]),
            record("2", "right-dim", vec![0.9, 0.1]),
        ];
        let result = CosineMatcher.find_best_match(&probe, &gallery, 0.5).unwrap();
        assert_eq!(result.name, "right-dim");
    }
}
