//! The scorecard artifact: per-scenario statistics, Pareto ranks and
//! weighted scores for one run. Assembly is a pure function of the graded
//! trials and the scoring settings, so the same traces always produce the
//! same bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    config::ScoringConfig,
    grading::GradedTrial,
    pareto::{composite, pareto_rank, weighted_score, Objective, ParetoEntry},
    scenario::TaskFamily,
    stats::{aggregate, AggregationError, MetricStats},
};

pub const SCORECARD_SCHEMA_VERSION: &str = "1.0";

/// Derived metric: share of seeds whose `task_success` is positive.
pub const ROBUSTNESS_METRIC: &str = "robustness";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioEntry {
    pub scenario_id: String,
    pub family: TaskFamily,
    pub seeds_run: usize,
    pub metrics: BTreeMap<String, MetricStats>,
    /// Termination reason counts across seeds.
    pub terminations: BTreeMap<String, usize>,
    pub pareto_rank: usize,
    pub pareto_optimal: bool,
    pub weighted_score: f64,
}

impl ScenarioEntry {
    pub fn median(&self, metric: &str) -> Option<f64> {
        self.metrics.get(metric).map(|stats| stats.median)
    }

    fn medians(&self) -> BTreeMap<String, f64> {
        let mut medians: BTreeMap<String, f64> = self
            .metrics
            .iter()
            .map(|(name, stats)| (name.clone(), stats.median))
            .collect();
        if let Some(success) = self.metrics.get("task_success") {
            medians.insert(ROBUSTNESS_METRIC.to_string(), 1.0 - success.failure_rate);
        }
        medians
    }
}

/// A scenario whose trials could not be aggregated. It is listed here and
/// left out of the entries, the Pareto ranking and the composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioFailure {
    pub scenario_id: String,
    pub family: TaskFamily,
    pub seeds_run: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    pub run_id: String,
    pub schema_version: String,
    pub model: String,
    pub objectives: Vec<Objective>,
    /// Sorted by scenario id.
    pub entries: Vec<ScenarioEntry>,
    /// Sorted by rank, then scenario id.
    pub pareto: Vec<ParetoEntry>,
    /// Mean weighted score of each family's scenarios.
    pub family_scores: BTreeMap<TaskFamily, f64>,
    pub composite_score: f64,
    /// Sorted by scenario id.
    #[serde(default)]
    pub failures: Vec<ScenarioFailure>,
}

/// Statistics, weighted score and objective values of one scenario.
fn build_entry(
    scenario_id: &str,
    group: &[&GradedTrial],
    scoring: &ScoringConfig,
) -> Result<(ScenarioEntry, Vec<f64>), AggregationError> {
    let per_seed: Vec<(u64, &_)> = group.iter().map(|t| (t.seed, &t.metrics)).collect();
    let metrics = aggregate(scenario_id, &per_seed, scoring.percentile)?;

    let mut terminations = BTreeMap::new();
    for trial in group {
        *terminations.entry(trial.termination.as_str().to_string()).or_insert(0) += 1;
    }

    let mut entry = ScenarioEntry {
        scenario_id: scenario_id.to_string(),
        family: group[0].family,
        seeds_run: group.len(),
        metrics,
        terminations,
        pareto_rank: 0,
        pareto_optimal: false,
        weighted_score: 0.0,
    };
    entry.weighted_score = weighted_score(&entry.medians(), &scoring.metric_weights);

    let objectives = scoring
        .objectives
        .iter()
        .map(|objective| {
            entry
                .median(&objective.metric)
                .ok_or_else(|| AggregationError::MissingObjective {
                    scenario: scenario_id.to_string(),
                    metric: objective.metric.clone(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((entry, objectives))
}

impl Scorecard {
    /// Scenarios that fail to aggregate are recorded in `failures`; the
    /// rest of the run is still scored.
    pub fn build(run_id: &str, model: &str, trials: &[GradedTrial], scoring: &ScoringConfig) -> Self {
        let mut grouped: BTreeMap<&str, Vec<&GradedTrial>> = BTreeMap::new();
        for trial in trials {
            grouped.entry(trial.scenario_id.as_str()).or_default().push(trial);
        }

        let mut entries = Vec::with_capacity(grouped.len());
        let mut points = Vec::with_capacity(grouped.len());
        let mut failures = Vec::new();
        for (scenario_id, mut group) in grouped {
            group.sort_by_key(|trial| trial.seed);
            match build_entry(scenario_id, &group, scoring) {
                Ok((entry, objectives)) => {
                    points.push((entry.scenario_id.clone(), objectives));
                    entries.push(entry);
                }
                Err(err) => {
                    error!(scenario = scenario_id, error = %err, "scenario left out of the scorecard");
                    failures.push(ScenarioFailure {
                        scenario_id: scenario_id.to_string(),
                        family: group[0].family,
                        seeds_run: group.len(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let pareto = pareto_rank(&points, &scoring.objectives);
        for entry in &mut entries {
            if let Some(ranked) = pareto.iter().find(|p| p.scenario_id == entry.scenario_id) {
                entry.pareto_rank = ranked.rank;
                entry.pareto_optimal = ranked.pareto_optimal;
            }
        }

        let mut per_family: BTreeMap<TaskFamily, Vec<f64>> = BTreeMap::new();
        for entry in &entries {
            per_family.entry(entry.family).or_default().push(entry.weighted_score);
        }
        let family_scores: BTreeMap<TaskFamily, f64> = per_family
            .into_iter()
            .map(|(family, scores)| (family, scores.iter().sum::<f64>() / scores.len() as f64))
            .collect();
        let composite_score = composite(&family_scores, &scoring.family_weights);

        Self {
            run_id: run_id.to_string(),
            schema_version: SCORECARD_SCHEMA_VERSION.to_string(),
            model: model.to_string(),
            objectives: scoring.objectives.clone(),
            entries,
            pareto,
            family_scores,
            composite_score,
            failures,
        }
    }

    pub fn entry(&self, scenario_id: &str) -> Option<&ScenarioEntry> {
        self.entries.iter().find(|e| e.scenario_id == scenario_id)
    }
}
