use std::sync::Arc;

use handlebars::Handlebars;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{JudgeKind, JudgeVerdict, Rubric};
use crate::{
    providers::LLMProvider,
    text::{extract_json, extract_numbers, tokenize},
    types::{ChatMessage, CompletionRequest},
};

const GRADER_SYSTEM: &str = "You are an impartial grader. Score the response against every \
criterion and answer with JSON only: {\"score\": <0.0-1.0>, \"rationale\": \"...\"}.";

const GRADER_TEMPLATE: &str = "Criteria:\n{{#each criteria}}- {{this}}\n{{/each}}\
{{#if reference}}\nReference answer:\n{{reference}}\n{{/if}}\nResponse to grade:\n{{output}}\n";

/// Confidence assigned to model-graded verdicts that do not state their own.
const MODEL_CONFIDENCE: f64 = 0.7;

/// Grades free text against the rubric's criteria.
///
/// With a provider, a model acts as the grader; its reply is parsed for a
/// `score` field, then for a bare number. Without one, or when grading
/// fails, the judge scores criteria coverage deterministically.
#[derive(Clone, Default)]
pub struct RubricJudge {
    grader: Option<(Arc<dyn LLMProvider>, String)>,
}

impl RubricJudge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grader(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            grader: Some((provider, model.into())),
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.grader
            .as_ref()
            .map_or(true, |(provider, _)| provider.is_deterministic())
    }

    pub async fn evaluate(&self, output: &str, rubric: &Rubric) -> JudgeVerdict {
        if rubric.criteria.is_empty() {
            return JudgeVerdict::abstain(JudgeKind::Rubric);
        }
        if let Some((provider, model)) = &self.grader {
            match grade_with_model(provider.as_ref(), model, output, rubric).await {
                Some((score, confidence)) => {
                    debug!(score, provider = provider.name(), "model grader verdict");
                    return JudgeVerdict::scored(JudgeKind::Rubric, &rubric.metric, score, confidence);
                }
                None => warn!(provider = provider.name(), "model grader failed; scoring criteria coverage"),
            }
        }
        JudgeVerdict::scored(
            JudgeKind::Rubric,
            &rubric.metric,
            criteria_coverage(output, &rubric.criteria),
            1.0,
        )
    }
}

async fn grade_with_model(
    provider: &dyn LLMProvider,
    model: &str,
    output: &str,
    rubric: &Rubric,
) -> Option<(f64, f64)> {
    let prompt = render_prompt(output, rubric)?;
    let request = CompletionRequest::new(
        model.to_string(),
        vec![ChatMessage::system(GRADER_SYSTEM), ChatMessage::user(prompt)],
    )
    .with_temperature(0.0);

    let response = match provider.complete(request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "grader call failed");
            return None;
        }
    };
    parse_grade(response.message.text().unwrap_or_default())
}

fn render_prompt(output: &str, rubric: &Rubric) -> Option<String> {
    let data = json!({
        "criteria": rubric.criteria,
        "reference": rubric.reference_text,
        "output": output,
    });
    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .render_template(GRADER_TEMPLATE, &data)
        .map_err(|err| warn!(error = %err, "grader prompt failed to render"))
        .ok()
}

/// Score and confidence from a grader reply. Scores on a 10 or 100 point
/// scale are brought back into [0, 1].
fn parse_grade(reply: &str) -> Option<(f64, f64)> {
    let (raw, confidence) = match extract_json(reply) {
        Some(Value::Object(fields)) => {
            let score = fields.get("score").and_then(Value::as_f64)?;
            let confidence = fields
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(MODEL_CONFIDENCE);
            (score, confidence)
        }
        _ => (extract_numbers(reply).into_iter().next()?, MODEL_CONFIDENCE),
    };
    let score = match raw {
        s if s <= 1.0 => s,
        s if s <= 10.0 => s / 10.0,
        s => s / 100.0,
    };
    Some((score.clamp(0.0, 1.0), confidence.clamp(0.0, 1.0)))
}

/// Fraction of criteria whose content words mostly appear in the output.
fn criteria_coverage(output: &str, criteria: &[String]) -> f64 {
    let tokens = tokenize(output);
    let covered = criteria
        .iter()
        .filter(|criterion| {
            let words: Vec<String> = tokenize(criterion).into_iter().filter(|w| w.len() > 3).collect();
            if words.is_empty() {
                return false;
            }
            let hits = words.iter().filter(|w| tokens.contains(w)).count();
            hits * 2 >= words.len()
        })
        .count();
    covered as f64 / criteria.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        mock::MockProvider,
        scripted::{ScriptedProvider, ScriptedReply},
    };

    fn rubric() -> Rubric {
        Rubric::default().with_criteria([
            "mentions retry with exponential backoff",
            "explains idempotency keys",
        ])
    }

    #[tokio::test]
    async fn coverage_without_grader() {
        let verdict = RubricJudge::new()
            .evaluate("We retry with exponential backoff.", &rubric())
            .await;
        assert_eq!(verdict.score("quality"), Some(0.5));
        assert!(RubricJudge::new().is_deterministic());
    }

    #[tokio::test]
    async fn model_grade_is_parsed() {
        let judge = RubricJudge::with_grader(Arc::new(MockProvider::new()), "mock");
        let verdict = judge.evaluate("anything", &rubric()).await;
        assert_eq!(verdict.score("quality"), Some(0.75));
    }

    #[tokio::test]
    async fn grader_failure_falls_back_to_coverage() {
        let provider = ScriptedProvider::new([ScriptedReply::Fatal("down".into())]);
        let judge = RubricJudge::with_grader(Arc::new(provider), "m");
        let verdict = judge.evaluate("idempotency keys explained", &rubric()).await;
        assert_eq!(verdict.score("quality"), Some(0.5));
        assert_eq!(verdict.confidence, 1.0);
    }

    #[test]
    fn grade_parsing_handles_scales_and_prose() {
        assert_eq!(parse_grade(r#"{"score": 0.4, "rationale": "ok"}"#), Some((0.4, 0.7)));
        assert_eq!(parse_grade("```json\n{\"score\": 8, \"confidence\": 0.9}\n```"), Some((0.8, 0.9)));
        assert_eq!(parse_grade("I'd give it 75 out of 100"), Some((0.75, 0.7)));
        assert_eq!(parse_grade("no idea"), None);
    }

    #[test]
    fn prompt_lists_criteria() {
        let prompt = render_prompt("the answer", &rubric()).expect("render");
        assert!(prompt.contains("- explains idempotency keys"));
        assert!(prompt.contains("the answer"));
        assert!(!prompt.contains("Reference answer"));
    }
}
