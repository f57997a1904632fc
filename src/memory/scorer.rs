//! Composite memory scoring: semantic similarity + recency decay + importance.
//!
//! `score = w_semantic * cosine + w_recency * exp(-λ·hours) + w_importance * importance`
//! with a configurable recency half-life (default 168 hours).

use chrono::{DateTime, Utc};

/// Weights for the three scoring factors.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub semantic: f64,
    pub recency: f64,
    pub importance: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            semantic: 0.5,
            recency: 0.3,
            importance: 0.2,
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

/// Scores memories with a weighted combination of similarity, recency, and
/// stored importance.
#[derive(Debug, Clone, Copy)]
pub struct CompositeScorer {
    weights: ScoreWeights,
    decay_lambda: f64,
}

impl CompositeScorer {
    pub fn new(weights: ScoreWeights, half_life_hours: f64) -> Self {
        Self {
            weights,
            decay_lambda: std::f64::consts::LN_2 / half_life_hours,
        }
    }

    pub fn score(
        &self,
        query_embedding: &[f32],
        memory_embedding: &[f32],
        created_at: DateTime<Utc>,
        importance: f64,
    ) -> f64 {
        let semantic = cosine_similarity(query_embedding, memory_embedding);

        let hours_since = (Utc::now() - created_at).num_seconds().max(0) as f64 / 3600.0;
        let recency = (-self.decay_lambda * hours_since).exp();

        self.weights.semantic * semantic
            + self.weights.recency * recency
            + self.weights.importance * importance
    }
}

impl Default for CompositeScorer {
    fn default() -> Self {
        Self::new(ScoreWeights::default(), 168.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fresh_identical_memory_scores_near_maximum() {
        let scorer = CompositeScorer::default();
        let v = vec![0.5f32, 0.5, 0.0];
        let score = scorer.score(&v, &v, Utc::now(), 1.0);
        // semantic 1.0 * 0.5 + recency ~1.0 * 0.3 + importance 1.0 * 0.2
        assert!(score > 0.99, "score = {score}");
    }

    #[test]
    fn old_memory_loses_recency() {
        let scorer = CompositeScorer::default();
        let v = vec![1.0f32, 0.0];
        let fresh = scorer.score(&v, &v, Utc::now(), 0.5);
        let stale = scorer.score(&v, &v, Utc::now() - Duration::days(30), 0.5);
        assert!(fresh > stale);
        // After 30 days the recency term is nearly gone.
        assert!((fresh - stale - 0.3).abs() < 0.05, "delta = {}", fresh - stale);
    }

    #[test]
    fn orthogonal_embedding_drops_semantic_term() {
        let scorer = CompositeScorer::default();
        let score = scorer.score(&[1.0, 0.0], &[0.0, 1.0], Utc::now(), 0.0);
        assert!(score <= 0.31, "score = {score}");
    }

    #[test]
    fn half_life_halves_recency() {
        let scorer = CompositeScorer::new(
            ScoreWeights {
                semantic: 0.0,
                recency: 1.0,
                importance: 0.0,
            },
            168.0,
        );
        let v = vec![1.0f32];
        let week_old = scorer.score(&v, &v, Utc::now() - Duration::hours(168), 0.0);
        assert!((week_old - 0.5).abs() < 0.01, "week-old recency = {week_old}");
    }
}
