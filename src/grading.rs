//! Per-trial grading: the scenario's own metrics plus ensemble scores when
//! the scenario publishes a rubric.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    judges::JudgeEnsemble,
    scenario::{MetricMap, Scenario, ScenarioResult, TaskFamily, TerminationReason},
};

/// Metrics for one trial, keyed back to the scenario and seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradedTrial {
    pub scenario_id: String,
    pub family: TaskFamily,
    pub seed: u64,
    pub termination: TerminationReason,
    pub metrics: MetricMap,
}

pub async fn grade_trial(scenario: &dyn Scenario, result: &ScenarioResult, ensemble: &JudgeEnsemble) -> GradedTrial {
    let mut metrics = scenario.grade(result);
    if let Some(rubric) = scenario.rubric() {
        for (name, value) in ensemble.score(result, &rubric).await {
            // scenario-defined metrics win over judge metrics of the same name
            metrics.entry(name).or_insert(value);
        }
    }
    debug!(
        scenario = %result.scenario_id,
        seed = result.seed,
        metrics = metrics.len(),
        "graded trial"
    );
    GradedTrial {
        scenario_id: result.scenario_id.clone(),
        family: scenario.config().family,
        seed: result.seed,
        termination: result.termination,
        metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        judges::{EnsembleConfig, AGREEMENT_METRIC},
        scenarios::{ConstraintScenario, ConvergenceScenario},
        types::ChatMessage,
    };

    fn result_for(scenario: &dyn Scenario, reply: &str) -> ScenarioResult {
        let mut messages = scenario.setup(0);
        messages.push(ChatMessage::user("go"));
        messages.push(ChatMessage::assistant(reply));
        ScenarioResult {
            scenario_id: scenario.config().id.clone(),
            seed: 0,
            messages,
            budget: Default::default(),
            termination: TerminationReason::PrompterDone,
            tool_calls: Vec::new(),
            model_errors: 0,
        }
    }

    #[tokio::test]
    async fn rubric_scenarios_gain_ensemble_metrics() {
        let ensemble = JudgeEnsemble::deterministic(EnsembleConfig::default());
        let scenario = ConvergenceScenario::new();
        let graded = grade_trial(&scenario, &result_for(&scenario, "Use logging."), &ensemble).await;
        assert!(graded.metrics.contains_key("quality"));
        assert!(graded.metrics.contains_key(AGREEMENT_METRIC));
        assert!(graded.metrics.contains_key("invariant_coverage"));
        assert_eq!(graded.family, TaskFamily::Convergence);
    }

    #[tokio::test]
    async fn scenarios_without_rubric_keep_their_metrics() {
        let ensemble = JudgeEnsemble::deterministic(EnsembleConfig::default());
        let scenario = ConstraintScenario::new();
        let result = result_for(&scenario, "{}");
        let graded = grade_trial(&scenario, &result, &ensemble).await;
        assert_eq!(graded.metrics, scenario.grade(&result));
    }
}
