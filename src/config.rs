//! Harness configuration: YAML on disk, CLI overrides on top, validated
//! once before a run starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{
    budget::BudgetConfig,
    judges::EnsembleConfig,
    pareto::Objective,
    runner::RunnerConfig,
    scenario::TaskFamily,
    stats::PercentileMethod,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_model_name() -> String {
    "mock".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// `mock`, `scripted`, or a model id served by an OpenAI-compatible endpoint.
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Replies for the `scripted` model, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub script: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            base_url: None,
            api_key_env: default_api_key_env(),
            temperature: 0.0,
            max_tokens: None,
            script: Vec::new(),
        }
    }
}

fn default_family_weights() -> BTreeMap<TaskFamily, f64> {
    TaskFamily::ALL.into_iter().map(|family| (family, 0.25)).collect()
}

fn default_metric_weights() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("task_success".to_string(), 0.5),
        ("efficiency".to_string(), 0.2),
        ("recovery_rate".to_string(), 0.15),
        ("robustness".to_string(), 0.15),
    ])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Per-family weight in the composite score; should sum to 1.
    #[serde(default = "default_family_weights")]
    pub family_weights: BTreeMap<TaskFamily, f64>,
    /// Per-metric weight in each scenario's weighted score.
    #[serde(default = "default_metric_weights")]
    pub metric_weights: BTreeMap<String, f64>,
    #[serde(default = "Objective::defaults")]
    pub objectives: Vec<Objective>,
    #[serde(default)]
    pub percentile: PercentileMethod,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            family_weights: default_family_weights(),
            metric_weights: default_metric_weights(),
            objectives: Objective::defaults(),
            percentile: PercentileMethod::default(),
        }
    }
}

fn default_scenarios() -> Vec<String> {
    vec!["all".to_string()]
}
fn default_seeds() -> u64 {
    3
}
fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub judges: EnsembleConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Scenario patterns: `all`, a family name, a `*` glob or an exact id.
    #[serde(default = "default_scenarios")]
    pub scenarios: Vec<String>,
    /// Trials per scenario, seeded `0..seeds`.
    #[serde(default = "default_seeds")]
    pub seeds: u64,
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            budget: BudgetConfig::default(),
            runner: RunnerConfig::default(),
            judges: EnsembleConfig::default(),
            scoring: ScoringConfig::default(),
            scenarios: default_scenarios(),
            seeds: default_seeds(),
            runs_dir: default_runs_dir(),
        }
    }
}

/// Command-line values that take precedence over the file when set.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub model: Option<String>,
    pub scenarios: Option<Vec<String>>,
    pub seeds: Option<u64>,
    pub budget_tokens: Option<u64>,
    pub budget_turns: Option<usize>,
    pub temperature: Option<f32>,
    pub concurrency: Option<usize>,
    pub runs_dir: Option<PathBuf>,
}

fn check_weight(what: &str, weight: f64) -> Result<(), ConfigError> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{what} weight must be a non-negative number, got {weight}")))
    }
}

fn check_non_negative(what: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{what} must be a non-negative number, got {value}")))
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_overrides(&mut self, overrides: CliOverrides) {
        if let Some(model) = overrides.model {
            self.model.name = model;
        }
        if let Some(scenarios) = overrides.scenarios.filter(|s| !s.is_empty()) {
            self.scenarios = scenarios;
        }
        if let Some(seeds) = overrides.seeds {
            self.seeds = seeds;
        }
        if let Some(tokens) = overrides.budget_tokens {
            self.budget.tokens = tokens;
        }
        if let Some(turns) = overrides.budget_turns {
            self.budget.turns = turns;
        }
        if let Some(temperature) = overrides.temperature {
            self.model.temperature = temperature;
        }
        if let Some(concurrency) = overrides.concurrency {
            self.runner.concurrency = concurrency;
        }
        if let Some(runs_dir) = overrides.runs_dir {
            self.runs_dir = runs_dir;
        }
    }

    /// Rejects settings a run cannot use. Family weights that do not sum
    /// to one are rescaled in place.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.seeds == 0 {
            return Err(ConfigError::Invalid("seeds must be at least 1".to_string()));
        }
        if self.runner.concurrency == 0 {
            return Err(ConfigError::Invalid("runner.concurrency must be at least 1".to_string()));
        }
        if self.scenarios.is_empty() {
            return Err(ConfigError::Invalid("no scenario patterns given".to_string()));
        }
        if self.scoring.objectives.is_empty() {
            return Err(ConfigError::Invalid("scoring.objectives must not be empty".to_string()));
        }
        if !(self.model.temperature.is_finite() && self.model.temperature >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "model.temperature must be non-negative, got {}",
                self.model.temperature
            )));
        }
        for (judge, weight) in &self.judges.weights {
            check_weight(judge.as_str(), *weight)?;
        }
        check_non_negative("judges.disagreement_threshold", self.judges.disagreement_threshold)?;
        check_non_negative("judges.disagreement_penalty", self.judges.disagreement_penalty)?;
        for (metric, weight) in &self.scoring.metric_weights {
            check_weight(metric, *weight)?;
        }
        for (family, weight) in &self.scoring.family_weights {
            check_weight(family.as_str(), *weight)?;
        }

        let total: f64 = self.scoring.family_weights.values().sum();
        if total <= 0.0 {
            return Err(ConfigError::Invalid("family weights sum to zero".to_string()));
        }
        if (total - 1.0).abs() > 1e-6 {
            warn!(total, "family weights do not sum to 1.0; normalizing");
            for weight in self.scoring.family_weights.values_mut() {
                *weight /= total;
            }
        }
        Ok(())
    }
}
