//! Weighted reciprocal-rank fusion
//!
//! Combines the lexical and semantic rankings into one score per chunk.
//! RRF needs no score normalization and is robust to the very different
//! distributions BM25 and cosine produce; the weights steer how much each
//! ranking contributes.

use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WeightedRrf {
    /// Rank-damping constant (typically 60)
    pub k: f32,

    pub lexical_weight: f32,

    pub semantic_weight: f32,
}

impl Default for WeightedRrf {
    fn default() -> Self {
        Self {
            k: 60.0,
            lexical_weight: 0.4,
            semantic_weight: 0.6,
        }
    }
}

impl WeightedRrf {
    pub fn new(k: f32, lexical_weight: f32, semantic_weight: f32) -> Self {
        Self {
            k,
            lexical_weight,
            semantic_weight,
        }
    }

    /// Fuse two rankings (best first) into a fused score per chunk id,
    /// normalized so the best fused score is 1.0.
    pub fn fuse(&self, lexical_ranking: &[Uuid], semantic_ranking: &[Uuid]) -> HashMap<Uuid, f32> {
        let mut scores: HashMap<Uuid, f32> = HashMap::new();

        for (rank, id) in lexical_ranking.iter().enumerate() {
            *scores.entry(*id).or_insert(0.0) +=
                self.lexical_weight / (self.k + (rank + 1) as f32);
        }

        for (rank, id) in semantic_ranking.iter().enumerate() {
            *scores.entry(*id).or_insert(0.0) +=
                self.semantic_weight / (self.k + (rank + 1) as f32);
        }

        let max = scores.values().cloned().fold(0.0f32, f32::max);
        if max > 0.0 {
            for score in scores.values_mut() {
                *score /= max;
            }
        }

        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_in_both_rankings_wins() {
        let fusion = WeightedRrf::default();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let c = Uuid::from_u128(3);
        let d = Uuid::from_u128(4);

        // b appears near the top of both rankings
        let scores = fusion.fuse(&[b, a, c], &[b, d, a]);

        let best = scores
            .iter()
            .max_by(|x, y| x.1.partial_cmp(y.1).unwrap())
            .map(|(id, _)| *id)
            .unwrap();

        assert_eq!(best, b);
        assert!((scores[&b] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_weights_steer_single_list_results() {
        let fusion = WeightedRrf::new(60.0, 1.0, 0.0);
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);

        let scores = fusion.fuse(&[a], &[b]);

        assert!(scores[&a] > 0.0);
        assert_eq!(scores[&b], 0.0);
    }
}
