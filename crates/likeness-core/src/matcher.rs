//! Nearest-neighbour matching of a probe embedding against the identity gallery.

use crate::types::{Embedding, IdentityRecord};

/// Distance at which the similarity score reaches zero.
///
/// Calibrated against the embedding model's intra/inter-identity distance
/// range. Changing it changes matching behavior.
pub const DISTANCE_SCALE: f32 = 1.2;

/// Minimum similarity for a positive match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.4;

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// The accepted identity, if the best similarity cleared the threshold.
    pub identity: Option<IdentityRecord>,
    /// Similarity of the best candidate in [0, 1], reported even on rejection.
    pub similarity: f32,
    /// Raw distance of the best candidate, if any candidate was comparable.
    pub distance: Option<f32>,
}

impl MatchResult {
    fn empty() -> Self {
        Self {
            identity: None,
            similarity: 0.0,
            distance: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// Strategy for comparing a probe embedding against a gallery of identities.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[IdentityRecord], threshold: f32) -> MatchResult;
}

/// Euclidean-distance matcher with a linear, clamped distance-to-similarity map.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub scale: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            scale: DISTANCE_SCALE,
        }
    }
}

impl EuclideanMatcher {
    /// `max(0, 1 - distance / scale)`.
    pub fn similarity(&self, distance: f32) -> f32 {
        (1.0 - distance / self.scale).max(0.0)
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[IdentityRecord], threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, record) in gallery.iter().enumerate() {
            let Some(distance) = probe.euclidean_distance(&record.embedding) else {
                tracing::warn!(
                    id = record.id,
                    expected = probe.dimension(),
                    actual = record.embedding.dimension(),
                    "skipping candidate with mismatched embedding dimension"
                );
                continue;
            };
            if !distance.is_finite() {
                tracing::warn!(id = record.id, "skipping candidate with non-finite distance");
                continue;
            }
            tracing::debug!(id = record.id, name = %record.name, distance, "compared candidate");

            // Strict `<`: on exact ties the earlier record wins.
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        let Some((idx, distance)) = best else {
            return MatchResult::empty();
        };

        let similarity = self.similarity(distance);
        let identity = (similarity >= threshold).then(|| gallery[idx].clone());

        tracing::debug!(
            best = %gallery[idx].name,
            distance,
            similarity,
            threshold,
            matched = identity.is_some(),
            "match complete"
        );

        MatchResult {
            identity,
            similarity,
            distance: Some(distance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: u64, name: &str, values: Vec<f32>) -> IdentityRecord {
        let now = Utc::now();
        IdentityRecord {
            id,
            name: name.into(),
            embedding: Embedding::new(values),
            thumbnail: None,
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_empty_gallery() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = EuclideanMatcher::default().compare(&probe, &[], DEFAULT_SIMILARITY_THRESHOLD);
        assert!(!result.is_match());
        assert_eq!(result.similarity, 0.0);
        assert_eq!(result.distance, None);
    }

    #[test]
    fn test_exact_match_has_full_similarity() {
        let probe = Embedding::new(vec![0.1, 0.2, 0.3]);
        let gallery = vec![
            record(1, "decoy", vec![0.9, 0.9, 0.9]),
            record(2, "alice", vec![0.1, 0.2, 0.3]),
        ];
        let result = EuclideanMatcher::default().compare(&probe, &gallery, 1.0);
        assert_eq!(result.similarity, 1.0);
        assert_eq!(result.identity.map(|r| r.id), Some(2));
    }

    #[test]
    fn test_below_threshold_reports_similarity() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![record(1, "far", vec![0.9, 0.0])];
        let result = EuclideanMatcher::default().compare(&probe, &gallery, DEFAULT_SIMILARITY_THRESHOLD);
        assert!(!result.is_match());
        let expected = (1.0f32 - 0.9 / DISTANCE_SCALE).max(0.0);
        assert!((result.similarity - expected).abs() < 1e-6);
        assert!((result.similarity - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_clamped_at_zero() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![record(1, "very far", vec![3.0, 4.0])];
        let result = EuclideanMatcher::default().compare(&probe, &gallery, 0.0);
        assert_eq!(result.similarity, 0.0);
        assert_eq!(result.distance, Some(5.0));
        // threshold 0.0 accepts any comparable candidate
        assert!(result.is_match());
    }

    #[test]
    fn test_picks_minimum_distance() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![
            record(1, "a", vec![0.5, 0.0]),
            record(2, "b", vec![0.1, 0.0]),
            record(3, "c", vec![0.3, 0.0]),
        ];
        let result = EuclideanMatcher::default().compare(&probe, &gallery, DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(result.identity.map(|r| r.name), Some("b".to_string()));
    }

    #[test]
    fn test_tie_prefers_earlier_record() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![
            record(4, "first", vec![0.0, 0.2]),
            record(9, "second", vec![0.2, 0.0]),
        ];
        let result = EuclideanMatcher::default().compare(&probe, &gallery, DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(result.identity.map(|r| r.id), Some(4));
    }

    #[test]
    fn test_skips_malformed_candidates() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![
            record(1, "wrong dim", vec![0.0, 0.0, 0.0]),
            record(2, "nan", vec![f32::NAN, 0.0]),
            record(3, "good", vec![0.12, 0.0]),
        ];
        let result = EuclideanMatcher::default().compare(&probe, &gallery, DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(result.identity.map(|r| r.id), Some(3));
        assert!((result.similarity - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_only_malformed_candidates() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![record(1, "wrong dim", vec![0.0])];
        let result = EuclideanMatcher::default().compare(&probe, &gallery, DEFAULT_SIMILARITY_THRESHOLD);
        assert!(!result.is_match());
        assert_eq!(result.similarity, 0.0);
    }
}
