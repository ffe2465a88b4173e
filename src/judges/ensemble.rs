use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ConstraintJudge, EmbeddingJudge, Judge, JudgeKind, JudgeVerdict, Rubric, RubricJudge};
use crate::{
    providers::LLMProvider,
    scenario::{MetricMap, ScenarioResult},
    types::final_assistant_text,
};

/// Metric reporting how closely the judges agreed, `1 - largest spread`.
pub const AGREEMENT_METRIC: &str = "judge_agreement";

fn default_weights() -> BTreeMap<JudgeKind, f64> {
    BTreeMap::from([
        (JudgeKind::Constraint, 0.3),
        (JudgeKind::Embedding, 0.3),
        (JudgeKind::Rubric, 0.4),
    ])
}
fn default_threshold() -> f64 {
    0.2
}
fn default_penalty() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default = "default_weights")]
    pub weights: BTreeMap<JudgeKind, f64>,
    /// Spread between judges above which the penalty applies.
    #[serde(default = "default_threshold")]
    pub disagreement_threshold: f64,
    /// Score lost per unit of spread once past the threshold.
    #[serde(default = "default_penalty")]
    pub disagreement_penalty: f64,
    /// Model that grades rubric criteria during calibration. Run and
    /// re-grade scoring always uses the deterministic rubric judge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric_model: Option<String>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            weights: default_weights(),
            disagreement_threshold: default_threshold(),
            disagreement_penalty: default_penalty(),
            rubric_model: None,
        }
    }
}

impl EnsembleConfig {
    pub fn weight(&self, judge: JudgeKind) -> f64 {
        self.weights.get(&judge).copied().unwrap_or(0.0)
    }
}

/// Combines `(weight, score)` pairs into one score. The base is the lower of
/// the weighted and the unweighted mean, so a weighted judge can pull the
/// result down but never lift it above the plain average; widening the
/// spread at a fixed mean therefore never raises the score. Past
/// `threshold` the base is further reduced by `penalty * spread`.
/// Returns the combined score and the spread.
pub fn combine_scores(contributions: &[(f64, f64)], threshold: f64, penalty: f64) -> (f64, f64) {
    let total_weight: f64 = contributions.iter().map(|(w, _)| w).sum();
    if contributions.is_empty() || total_weight <= 0.0 {
        return (0.0, 0.0);
    }
    let weighted = contributions.iter().map(|(w, s)| w * s).sum::<f64>() / total_weight;
    let plain = contributions.iter().map(|(_, s)| s).sum::<f64>() / contributions.len() as f64;
    let mean = weighted.min(plain);
    let (lo, hi) = contributions
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, s)| (lo.min(*s), hi.max(*s)));
    let spread = hi - lo;

    let combined = if spread > threshold {
        mean - penalty * spread
    } else {
        mean
    };
    (combined.clamp(0.0, 1.0), spread)
}

pub struct JudgeEnsemble {
    judges: Vec<Judge>,
    config: EnsembleConfig,
}

impl JudgeEnsemble {
    pub fn new(config: EnsembleConfig) -> Self {
        Self {
            judges: Vec::new(),
            config,
        }
    }

    /// Constraint, embedding and provider-less rubric judges. Every judge in
    /// it is deterministic, so re-grading a trace reproduces its scores.
    pub fn deterministic(config: EnsembleConfig) -> Self {
        Self::new(config)
            .with_judge(ConstraintJudge)
            .with_judge(EmbeddingJudge::default())
            .with_judge(RubricJudge::new())
    }

    /// The deterministic judges, with `model` on `provider` grading rubric
    /// criteria instead of criteria coverage.
    pub fn graded(config: EnsembleConfig, provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self::new(config)
            .with_judge(ConstraintJudge)
            .with_judge(EmbeddingJudge::default())
            .with_judge(RubricJudge::with_grader(provider, model))
    }

    pub fn with_judge(mut self, judge: impl Into<Judge>) -> Self {
        self.judges.push(judge.into());
        self
    }

    pub fn judges(&self) -> &[Judge] {
        &self.judges
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn is_deterministic(&self) -> bool {
        self.judges.iter().all(Judge::is_deterministic)
    }

    /// Judges run concurrently; verdicts come back in registration order.
    pub async fn verdicts(&self, output: &str, rubric: &Rubric) -> Vec<JudgeVerdict> {
        join_all(self.judges.iter().map(|judge| judge.evaluate(output, rubric))).await
    }

    /// Scores the final assistant output of a trial.
    pub async fn score(&self, result: &ScenarioResult, rubric: &Rubric) -> MetricMap {
        let output = final_assistant_text(&result.messages).unwrap_or_default();
        let verdicts = self.verdicts(output, rubric).await;
        self.combine(&verdicts)
    }

    /// Folds verdicts into one metric map. Judges with zero weight or no
    /// opinion on a metric do not contribute to it. Always reports
    /// [`AGREEMENT_METRIC`].
    pub fn combine(&self, verdicts: &[JudgeVerdict]) -> MetricMap {
        let mut per_metric: BTreeMap<&str, Vec<(f64, f64)>> = BTreeMap::new();
        for verdict in verdicts {
            let weight = self.config.weight(verdict.judge);
            if weight <= 0.0 {
                continue;
            }
            for (metric, score) in &verdict.metrics {
                per_metric.entry(metric).or_default().push((weight, *score));
            }
        }

        let mut metrics = MetricMap::new();
        let mut widest = 0.0f64;
        for (metric, contributions) in per_metric {
            let (combined, spread) = combine_scores(
                &contributions,
                self.config.disagreement_threshold,
                self.config.disagreement_penalty,
            );
            if spread > self.config.disagreement_threshold {
                debug!(metric, spread, combined, "judges disagree; penalty applied");
            }
            widest = widest.max(spread);
            metrics.insert(metric.to_string(), combined);
        }
        metrics.insert(AGREEMENT_METRIC.to_string(), (1.0 - widest).clamp(0.0, 1.0));
        metrics
    }
}
