//! Distributional statistics over per-seed metric values.

use std::collections::BTreeMap;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scenario::MetricMap;

#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("scenario {scenario} has no graded trials")]
    Empty { scenario: String },
    #[error("scenario {scenario}: metric `{metric}` missing for seed {seed}")]
    MissingMetric { scenario: String, metric: String, seed: u64 },
    #[error("scenario {scenario}: metric `{metric}` is not finite ({value})")]
    NonFinite { scenario: String, metric: String, value: f64 },
    #[error("scenario {scenario} has no objective metric `{metric}`")]
    MissingObjective { scenario: String, metric: String },
}

/// Interpolation between order statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentileMethod {
    /// Linear interpolation at rank `p/100 * (n - 1)`.
    #[default]
    Linear,
    /// Smallest value whose rank covers `p` percent of the sample.
    NearestRank,
}

/// `p` in `[0, 100]` over an ascending, non-empty slice.
pub fn percentile(sorted: &[f64], p: f64, method: PercentileMethod) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 100.0);
    match method {
        PercentileMethod::Linear => {
            let rank = p / 100.0 * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let fraction = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
        }
        PercentileMethod::NearestRank => {
            let rank = (p / 100.0 * n as f64).ceil() as usize;
            sorted[rank.clamp(1, n) - 1]
        }
    }
}

pub const BOOTSTRAP_RESAMPLES: usize = 1000;
pub const BOOTSTRAP_CONFIDENCE: f64 = 0.95;
/// Fixed so re-grading reproduces the same interval.
pub const BOOTSTRAP_SEED: u64 = 42;

/// Percentile bootstrap interval of the mean: `resamples` draws with
/// replacement from `values`, bounds at `(1 - confidence) / 2` and its
/// mirror. Fewer than two values collapse to a point.
pub fn bootstrap_ci(values: &[f64], resamples: usize, confidence: f64, seed: u64) -> (f64, f64) {
    match values {
        [] => return (0.0, 0.0),
        [only] => return (*only, *only),
        _ => {}
    }
    if resamples == 0 {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        return (mean, mean);
    }

    let n = values.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut means: Vec<f64> = (0..resamples)
        .map(|_| (0..n).map(|_| values[rng.gen_range(0..n)]).sum::<f64>() / n as f64)
        .collect();
    means.sort_by(f64::total_cmp);

    let alpha = (1.0 - confidence.clamp(0.0, 1.0)) * 100.0;
    (
        percentile(&means, alpha / 2.0, PercentileMethod::Linear),
        percentile(&means, 100.0 - alpha / 2.0, PercentileMethod::Linear),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub median: f64,
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub p10: f64,
    pub p90: f64,
    pub min: f64,
    pub max: f64,
    /// Fraction of seeds at or below zero.
    pub failure_rate: f64,
    /// 95% bootstrap confidence interval of the mean.
    #[serde(default)]
    pub ci_low: f64,
    #[serde(default)]
    pub ci_high: f64,
    /// Raw values in seed order.
    pub values: Vec<f64>,
}

impl MetricStats {
    /// `None` for an empty slice.
    pub fn from_values(values: &[f64], method: PercentileMethod) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let (ci_low, ci_high) = bootstrap_ci(values, BOOTSTRAP_RESAMPLES, BOOTSTRAP_CONFIDENCE, BOOTSTRAP_SEED);
        Some(Self {
            median: percentile(&sorted, 50.0, PercentileMethod::Linear),
            mean,
            std: variance.sqrt(),
            p10: percentile(&sorted, 10.0, method),
            p90: percentile(&sorted, 90.0, method),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            failure_rate: values.iter().filter(|v| **v <= 0.0).count() as f64 / n,
            ci_low,
            ci_high,
            values: values.to_vec(),
        })
    }
}

/// Reduces one scenario's per-seed metric maps into statistics per metric.
/// Every seed must report exactly the same metric names with finite values.
pub fn aggregate(
    scenario: &str,
    per_seed: &[(u64, &MetricMap)],
    method: PercentileMethod,
) -> Result<BTreeMap<String, MetricStats>, AggregationError> {
    let Some((first_seed, first)) = per_seed.first() else {
        return Err(AggregationError::Empty {
            scenario: scenario.to_string(),
        });
    };

    for (seed, metrics) in per_seed {
        if let Some(metric) = first.keys().find(|name| !metrics.contains_key(*name)) {
            return Err(AggregationError::MissingMetric {
                scenario: scenario.to_string(),
                metric: metric.clone(),
                seed: *seed,
            });
        }
        if let Some(metric) = metrics.keys().find(|name| !first.contains_key(*name)) {
            // the first seed is the one missing it
            return Err(AggregationError::MissingMetric {
                scenario: scenario.to_string(),
                metric: metric.clone(),
                seed: *first_seed,
            });
        }
        if let Some((metric, value)) = metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(AggregationError::NonFinite {
                scenario: scenario.to_string(),
                metric: metric.clone(),
                value: *value,
            });
        }
    }

    let mut out = BTreeMap::new();
    for name in first.keys() {
        let values: Vec<f64> = per_seed.iter().map(|(_, metrics)| metrics[name]).collect();
        if let Some(stats) = MetricStats::from_values(&values, method) {
            out.insert(name.clone(), stats);
        }
    }
    Ok(out)
}
