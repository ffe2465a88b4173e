//! Judges score a trial's final output against a [`Rubric`]. The set of
//! judges is closed: constraint checks, embedding similarity and a rubric
//! grader, reduced into one metric map by [`JudgeEnsemble`].

pub mod calibration;
pub mod constraint;
pub mod embedding;
pub mod ensemble;
pub mod rubric;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scenario::MetricMap;

pub use calibration::{calibrate, load_reference_set, CalibrationCase, CalibrationReport, JudgeCalibration};
pub use constraint::ConstraintJudge;
pub use embedding::EmbeddingJudge;
pub use ensemble::{combine_scores, EnsembleConfig, JudgeEnsemble, AGREEMENT_METRIC};
pub use rubric::RubricJudge;

fn default_metric() -> String {
    "quality".to_string()
}

/// What judges look for in a trial's final output. Scenarios expose one
/// through `Scenario::rubric` when they want ensemble scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    /// Metric every judge contributes to.
    #[serde(default = "default_metric")]
    pub metric: String,
    /// Free-text grading criteria for the rubric judge.
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub required_invariants: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Regular expressions the output must match.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub min_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_text: Option<String>,
}

impl Default for Rubric {
    fn default() -> Self {
        Self {
            metric: default_metric(),
            criteria: Vec::new(),
            required_invariants: Vec::new(),
            keywords: Vec::new(),
            patterns: Vec::new(),
            min_length: 0,
            reference_text: None,
        }
    }
}

impl Rubric {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            ..Self::default()
        }
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_invariants<I, S>(mut self, invariants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_invariants = invariants.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = min_length;
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference_text = Some(reference.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeKind {
    Constraint,
    Embedding,
    Rubric,
}

impl JudgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeKind::Constraint => "constraint",
            JudgeKind::Embedding => "embedding",
            JudgeKind::Rubric => "rubric",
        }
    }
}

impl fmt::Display for JudgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One judge's contribution. An empty `metrics` map means the judge had
/// nothing to check and abstains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub judge: JudgeKind,
    pub metrics: MetricMap,
    /// How far the judge trusts its own verdict, in [0, 1].
    pub confidence: f64,
}

impl JudgeVerdict {
    pub fn scored(judge: JudgeKind, metric: &str, score: f64, confidence: f64) -> Self {
        let mut metrics = MetricMap::new();
        metrics.insert(metric.to_string(), score.clamp(0.0, 1.0));
        Self {
            judge,
            metrics,
            confidence,
        }
    }

    pub fn abstain(judge: JudgeKind) -> Self {
        Self {
            judge,
            metrics: MetricMap::new(),
            confidence: 0.0,
        }
    }

    pub fn score(&self, metric: &str) -> Option<f64> {
        self.metrics.get(metric).copied()
    }
}

pub enum Judge {
    Constraint(ConstraintJudge),
    Embedding(EmbeddingJudge),
    Rubric(RubricJudge),
}

impl Judge {
    pub fn kind(&self) -> JudgeKind {
        match self {
            Judge::Constraint(_) => JudgeKind::Constraint,
            Judge::Embedding(_) => JudgeKind::Embedding,
            Judge::Rubric(_) => JudgeKind::Rubric,
        }
    }

    pub fn is_deterministic(&self) -> bool {
        match self {
            Judge::Constraint(_) | Judge::Embedding(_) => true,
            Judge::Rubric(judge) => judge.is_deterministic(),
        }
    }

    pub async fn evaluate(&self, output: &str, rubric: &Rubric) -> JudgeVerdict {
        match self {
            Judge::Constraint(judge) => judge.evaluate(output, rubric),
            Judge::Embedding(judge) => judge.evaluate(output, rubric),
            Judge::Rubric(judge) => judge.evaluate(output, rubric).await,
        }
    }
}

impl From<ConstraintJudge> for Judge {
    fn from(judge: ConstraintJudge) -> Self {
        Judge::Constraint(judge)
    }
}

impl From<EmbeddingJudge> for Judge {
    fn from(judge: EmbeddingJudge) -> Self {
        Judge::Embedding(judge)
    }
}

impl From<RubricJudge> for Judge {
    fn from(judge: RubricJudge) -> Self {
        Judge::Rubric(judge)
    }
}
