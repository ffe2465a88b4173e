//! Hidden-target convergence: the prompter refines an open design question
//! over several rounds, and the best reply is checked against required
//! invariants, keywords and bonus concepts.

use super::classification::{bool_metric, ratio};
use crate::{
    judges::Rubric,
    prompter::{Prompter, ScriptedPrompter},
    scenario::{MetricMap, Scenario, ScenarioConfig, ScenarioResult, TaskFamily},
    types::ChatMessage,
};

pub const ID: &str = "convergence/error_handling";

const MIN_INVARIANTS_FOR_PASS: usize = 4;

const SYSTEM_PROMPT: &str = "You are a software architecture expert. When asked about system \
design topics, provide comprehensive, detailed responses covering all important aspects. Build on \
feedback to converge toward a complete solution.";

const REFINEMENTS: [&str; 3] = [
    "Describe a comprehensive error handling system for a production web application. Include all \
     major components and best practices.",
    "Good start. Now expand on each point: specifically address input validation strategies, \
     exception hierarchy design, and logging architecture with structured formats.",
    "Almost there. Add details about: graceful degradation patterns, circuit breakers for external \
     services, retry logic with exponential backoff, and how to generate user-friendly error \
     messages while hiding internal details. Also mention correlation IDs for request tracing.",
];

const REQUIRED_INVARIANTS: [&str; 5] = [
    "input validation",
    "exception hierarchy",
    "logging",
    "graceful degradation",
    "user-friendly error messages",
];

const BONUS_CONCEPTS: [&str; 6] = [
    "circuit breaker",
    "retry logic",
    "exponential backoff",
    "correlation id",
    "structured logging",
    "fallback",
];

const TARGET_KEYWORDS: [&str; 8] = [
    "validation",
    "exception",
    "log",
    "degrad",
    "error message",
    "retry",
    "circuit",
    "fallback",
];

const REFERENCE: &str = "A production error handling system validates input at every boundary, \
raises errors through a typed exception hierarchy, writes structured logging with a correlation id \
per request, wraps external services in a circuit breaker with retry logic and exponential \
backoff, degrades gracefully to cached fallback responses, and shows user-friendly error messages \
that hide internal details.";

/// An invariant is present when all of its words appear, or when any of
/// its longer words does.
fn invariant_present(lowered: &str, invariant: &str) -> bool {
    let words: Vec<&str> = invariant.split_whitespace().collect();
    words.iter().all(|w| lowered.contains(w)) || words.iter().any(|w| w.len() > 3 && lowered.contains(w))
}

pub fn matched_invariants(text: &str) -> usize {
    let lowered = text.to_lowercase();
    REQUIRED_INVARIANTS
        .iter()
        .filter(|inv| invariant_present(&lowered, inv))
        .count()
}

fn coverage(text: &str, terms: &[&str]) -> f64 {
    let lowered = text.to_lowercase();
    ratio(terms.iter().filter(|t| lowered.contains(*t)).count(), terms.len())
}

fn replies(messages: &[ChatMessage]) -> Vec<&str> {
    messages
        .iter()
        .filter(|m| m.is_reply())
        .filter_map(ChatMessage::text)
        .collect()
}

pub struct ConvergenceScenario {
    config: ScenarioConfig,
}

impl Default for ConvergenceScenario {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvergenceScenario {
    pub fn new() -> Self {
        Self {
            config: ScenarioConfig::new(TaskFamily::Convergence, "error_handling", "Error Handling System Design")
                .with_description(
                    "Converge on a comprehensive error handling design through iterative \
                     refinement. Evaluated against required invariants and bonus concepts.",
                ),
        }
    }
}

impl Scenario for ConvergenceScenario {
    fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    fn setup(&self, _seed: u64) -> Vec<ChatMessage> {
        vec![ChatMessage::system(SYSTEM_PROMPT)]
    }

    fn prompter(&self, _seed: u64) -> Box<dyn Prompter> {
        Box::new(ScriptedPrompter::new(REFINEMENTS))
    }

    /// Stops early once the latest reply covers every invariant and at
    /// least half of the bonus concepts.
    fn check_termination(&self, messages: &[ChatMessage], _turn: usize, _tokens_used: u64) -> bool {
        let Some(last) = messages
            .last()
            .filter(|m| m.is_reply())
            .and_then(ChatMessage::text)
        else {
            return false;
        };
        matched_invariants(last) == REQUIRED_INVARIANTS.len() && coverage(last, &BONUS_CONCEPTS) >= 0.5
    }

    fn grade(&self, result: &ScenarioResult) -> MetricMap {
        let replies = replies(&result.messages);
        let total = REQUIRED_INVARIANTS.len();

        // latest reply wins ties
        let best = replies
            .iter()
            .enumerate()
            .max_by_key(|(position, text)| (matched_invariants(text), *position))
            .map(|(_, text)| *text);

        let Some(best) = best else {
            return MetricMap::from([
                ("task_success".to_string(), 0.0),
                ("invariant_coverage".to_string(), 0.0),
                ("keyword_coverage".to_string(), 0.0),
                ("bonus_coverage".to_string(), 0.0),
                ("convergence_rate".to_string(), 0.0),
                ("efficiency".to_string(), 0.0),
                ("invariants_matched".to_string(), 0.0),
                ("invariants_total".to_string(), total as f64),
            ]);
        };

        let matched = matched_invariants(best);
        let best_score = ratio(matched, total);
        let convergence_rate = match replies.as_slice() {
            [first, _, ..] => (best_score - ratio(matched_invariants(first), total)).max(0.0),
            _ => 0.0,
        };
        let efficiency = (1.0 - result.budget.tokens_used as f64 / 4000.0).max(0.0);

        MetricMap::from([
            ("task_success".to_string(), bool_metric(matched >= MIN_INVARIANTS_FOR_PASS)),
            ("invariant_coverage".to_string(), best_score),
            ("keyword_coverage".to_string(), coverage(best, &TARGET_KEYWORDS)),
            ("bonus_coverage".to_string(), coverage(best, &BONUS_CONCEPTS)),
            ("convergence_rate".to_string(), convergence_rate),
            ("efficiency".to_string(), efficiency),
            ("invariants_matched".to_string(), matched as f64),
            ("invariants_total".to_string(), total as f64),
        ])
    }

    fn rubric(&self) -> Option<Rubric> {
        Some(
            Rubric::default()
                .with_criteria([
                    "Covers input validation, an exception hierarchy, logging, graceful degradation and user-friendly error messages",
                    "Describes resilience patterns such as circuit breakers, retries with backoff and fallbacks",
                ])
                .with_invariants(REQUIRED_INVARIANTS)
                .with_keywords(TARGET_KEYWORDS)
                .with_min_length(200)
                .with_reference(REFERENCE),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::TerminationReason;

    fn result_with(replies: &[&str]) -> ScenarioResult {
        let scenario = ConvergenceScenario::new();
        let mut messages = scenario.setup(0);
        for reply in replies {
            messages.push(ChatMessage::user("go on"));
            messages.push(ChatMessage::assistant(*reply));
        }
        ScenarioResult {
            scenario_id: ID.to_string(),
            seed: 0,
            messages,
            budget: Default::default(),
            termination: TerminationReason::PrompterDone,
            tool_calls: Vec::new(),
            model_errors: 0,
        }
    }

    #[test]
    fn longer_words_count_as_partial_matches() {
        assert_eq!(matched_invariants("we log everything"), 0);
        assert_eq!(matched_invariants("centralized logging"), 1);
        assert_eq!(matched_invariants("graceful fallback and input checks"), 2);
    }

    #[test]
    fn improvement_over_rounds_is_measured() {
        let scenario = ConvergenceScenario::new();
        let metrics = scenario.grade(&result_with(&[
            "Use logging.",
            "Input validation, an exception hierarchy, logging, graceful degradation and friendly messages.",
        ]));
        assert_eq!(metrics["invariants_matched"], 5.0);
        assert_eq!(metrics["task_success"], 1.0);
        assert!((metrics["convergence_rate"] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn no_replies_grades_zero_with_the_same_metric_names() {
        let scenario = ConvergenceScenario::new();
        let empty = scenario.grade(&result_with(&[]));
        let full = scenario.grade(&result_with(&["logging"]));
        assert_eq!(empty["task_success"], 0.0);
        assert_eq!(empty.keys().collect::<Vec<_>>(), full.keys().collect::<Vec<_>>());
    }

    #[test]
    fn terminates_on_full_coverage() {
        let scenario = ConvergenceScenario::new();
        let thin = result_with(&["Input validation and logging."]);
        assert!(!scenario.check_termination(&thin.messages, 1, 0));
        let full = result_with(&[REFERENCE]);
        assert!(scenario.check_termination(&full.messages, 1, 0));
    }

    #[test]
    fn exposes_a_rubric_for_the_judges() {
        let rubric = ConvergenceScenario::new().rubric().expect("rubric");
        assert_eq!(rubric.required_invariants.len(), 5);
        assert!(rubric.reference_text.is_some());
    }
}
