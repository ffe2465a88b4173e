use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{JudgeKind, JudgeVerdict, Rubric};
use crate::text::tokenize;

fn default_threshold() -> f64 {
    0.3
}

/// Bag-of-words similarity against the rubric's reference text.
///
/// Raw cosine similarity is rescaled around `threshold`: anything below
/// maps into [0, 0.5), anything at or above into [0.5, 1]. Without a
/// reference text the judge falls back to keyword coverage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EmbeddingJudge {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for EmbeddingJudge {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

impl EmbeddingJudge {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(f64::EPSILON, 1.0 - f64::EPSILON),
        }
    }

    pub fn evaluate(&self, output: &str, rubric: &Rubric) -> JudgeVerdict {
        if let Some(reference) = rubric.reference_text.as_deref() {
            let similarity = cosine_similarity(output, reference);
            return JudgeVerdict::scored(JudgeKind::Embedding, &rubric.metric, self.scale(similarity), 1.0);
        }
        if rubric.keywords.is_empty() {
            return JudgeVerdict::abstain(JudgeKind::Embedding);
        }
        let tokens = tokenize(output);
        let covered = rubric
            .keywords
            .iter()
            .filter(|keyword| {
                let wanted = tokenize(keyword);
                !wanted.is_empty() && wanted.iter().all(|w| tokens.contains(w))
            })
            .count();
        JudgeVerdict::scored(
            JudgeKind::Embedding,
            &rubric.metric,
            covered as f64 / rubric.keywords.len() as f64,
            1.0,
        )
    }

    fn scale(&self, similarity: f64) -> f64 {
        let t = self.threshold;
        if similarity < t {
            0.5 * similarity / t
        } else {
            0.5 + 0.5 * (similarity - t) / (1.0 - t)
        }
    }
}

fn term_frequencies(text: &str) -> BTreeMap<String, f64> {
    let mut tf = BTreeMap::new();
    for token in tokenize(text) {
        *tf.entry(token).or_insert(0.0) += 1.0;
    }
    tf
}

/// Cosine similarity of term-frequency vectors. Zero when either side has
/// no tokens.
pub fn cosine_similarity(a: &str, b: &str) -> f64 {
    let (ta, tb) = (term_frequencies(a), term_frequencies(b));
    let dot: f64 = ta
        .iter()
        .filter_map(|(term, x)| tb.get(term).map(|y| x * y))
        .sum();
    let norm = |tf: &BTreeMap<String, f64>| tf.values().map(|v| v * v).sum::<f64>().sqrt();
    let denom = norm(&ta) * norm(&tb);
    if denom == 0.0 {
        0.0
    } else {
        (dot / denom).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_scores_one() {
        let rubric = Rubric::default().with_reference("retry transient failures with backoff");
        let verdict = EmbeddingJudge::default().evaluate("Retry transient failures with backoff", &rubric);
        assert!((verdict.score("quality").unwrap_or_default() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unrelated_text_lands_below_half() {
        let rubric = Rubric::default().with_reference("retry transient failures with backoff");
        let score = EmbeddingJudge::default()
            .evaluate("the cat sat on the mat", &rubric)
            .score("quality")
            .unwrap_or(1.0);
        assert!(score < 0.5);
    }

    #[test]
    fn threshold_maps_to_midpoint() {
        let judge = EmbeddingJudge::new(0.4);
        assert!((judge.scale(0.4) - 0.5).abs() < 1e-12);
        assert!((judge.scale(0.2) - 0.25).abs() < 1e-12);
        assert!((judge.scale(1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn keyword_coverage_without_reference() {
        let rubric = Rubric::default().with_keywords(["circuit breaker", "idempotent"]);
        let verdict = EmbeddingJudge::default().evaluate("Use a circuit breaker.", &rubric);
        assert_eq!(verdict.score("quality"), Some(0.5));
    }
}
