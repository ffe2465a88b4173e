//! JSON schema conformance with validation feedback between attempts.

use std::sync::Arc;

use jsonschema::{Draft, JSONSchema};
use serde_json::{json, Value};

use super::classification::bool_metric;
use crate::{
    config::ConfigError,
    prompter::Prompter,
    scenario::{MetricMap, Scenario, ScenarioConfig, ScenarioResult, TaskFamily},
    types::ChatMessage,
};

pub const ID: &str = "constraint/json_schema";

const MAX_ATTEMPTS: usize = 3;
const MAX_REPORTED_ERRORS: usize = 5;

const SYSTEM_PROMPT: &str = "You are a data generation assistant. When asked to produce JSON \
matching a JSON schema, output ONLY valid JSON with no surrounding text, markdown, or explanation.";

pub fn person_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": {"type": "string", "minLength": 1},
            "age": {"type": "integer", "minimum": 0, "maximum": 150},
            "email": {"type": "string", "pattern": "^[^@]+@[^@]+\\.[^@]+$"},
            "address": {
                "type": "object",
                "properties": {
                    "street": {"type": "string", "minLength": 1},
                    "city": {"type": "string", "minLength": 1},
                    "state": {"type": "string", "minLength": 2, "maxLength": 2},
                    "zip": {"type": "string", "pattern": "^\\d{5}$"}
                },
                "required": ["street", "city", "state", "zip"]
            }
        },
        "required": ["name", "age", "email", "address"]
    })
}

fn compile(schema: &Value) -> Result<JSONSchema, String> {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|err| err.to_string())
}

/// The document in a reply: the whole trimmed text, or the body of a
/// single fenced block.
fn parse_document(reply: &str) -> Result<Value, String> {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```")
        .and_then(|rest| rest.split_once('\n'))
        .and_then(|(_, rest)| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body).map_err(|err| format!("invalid JSON: {err}"))
}

/// Validation errors for a reply; empty when it conforms.
pub fn validation_errors(schema: &Value, reply: &str) -> Vec<String> {
    let document = match parse_document(reply) {
        Ok(document) => document,
        Err(err) => return vec![err],
    };
    let compiled = match compile(schema) {
        Ok(compiled) => compiled,
        Err(err) => return vec![format!("schema does not compile: {err}")],
    };
    let result = match compiled.validate(&document) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|err| {
                let path = err.instance_path.to_string();
                format!("{}: {err}", if path.is_empty() { "/" } else { path.as_str() })
            })
            .collect(),
    };
    result
}

/// Instructs once, then feeds validation errors back until the reply
/// conforms or the attempts run out.
struct FeedbackPrompter {
    schema: Arc<Value>,
}

impl Prompter for FeedbackPrompter {
    fn next_message(&mut self, messages: &[ChatMessage], prompts_sent: usize) -> Option<String> {
        if prompts_sent == 0 {
            let pretty = serde_json::to_string_pretty(self.schema.as_ref()).unwrap_or_default();
            return Some(format!(
                "Generate a valid JSON object that matches this schema exactly:\n```json\n{pretty}\n```\n\
                 Output ONLY the JSON, no other text."
            ));
        }
        let replies: Vec<&str> = messages
            .iter()
            .filter(|m| m.is_reply())
            .filter_map(ChatMessage::text)
            .collect();
        let last = replies.last()?;
        let errors = validation_errors(&self.schema, last);
        if errors.is_empty() || replies.len() >= MAX_ATTEMPTS {
            return None;
        }
        let listed: Vec<String> = errors
            .iter()
            .take(MAX_REPORTED_ERRORS)
            .map(|e| format!("- {e}"))
            .collect();
        Some(format!(
            "The JSON has validation errors:\n{}\nPlease fix and output ONLY the corrected JSON.",
            listed.join("\n")
        ))
    }
}

pub struct ConstraintScenario {
    config: ScenarioConfig,
    schema: Arc<Value>,
}

impl Default for ConstraintScenario {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstraintScenario {
    pub fn new() -> Self {
        Self {
            config: ScenarioConfig::new(TaskFamily::Constraint, "json_schema", "JSON Schema Conformance")
                .with_description(
                    "Produce a JSON object matching a given schema. Scored by pass rate, \
                     retries and token cost.",
                ),
            schema: Arc::new(person_schema()),
        }
    }

    /// Same scenario against a custom schema, registered under
    /// `constraint/<slug>`. The schema must compile as Draft 7.
    pub fn with_schema(slug: &str, schema: Value) -> Result<Self, ConfigError> {
        compile(&schema).map_err(|err| ConfigError::Invalid(format!("schema for {slug}: {err}")))?;
        Ok(Self {
            config: ScenarioConfig::new(TaskFamily::Constraint, slug, "JSON Schema Conformance"),
            schema: Arc::new(schema),
        })
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }
}

impl Scenario for ConstraintScenario {
    fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    fn setup(&self, _seed: u64) -> Vec<ChatMessage> {
        vec![ChatMessage::system(SYSTEM_PROMPT)]
    }

    fn prompter(&self, _seed: u64) -> Box<dyn Prompter> {
        Box::new(FeedbackPrompter {
            schema: Arc::clone(&self.schema),
        })
    }

    fn check_termination(&self, messages: &[ChatMessage], _turn: usize, _tokens_used: u64) -> bool {
        messages
            .last()
            .filter(|m| m.is_reply())
            .and_then(ChatMessage::text)
            .is_some_and(|reply| validation_errors(&self.schema, reply).is_empty())
    }

    fn grade(&self, result: &ScenarioResult) -> MetricMap {
        let outcomes: Vec<bool> = result
            .messages
            .iter()
            .filter(|m| m.is_reply())
            .map(|m| validation_errors(&self.schema, m.text().unwrap_or_default()).is_empty())
            .collect();

        let passed = outcomes.iter().any(|ok| *ok);
        let first_pass = outcomes.first().copied().unwrap_or(false);
        let recovered = passed && !first_pass && outcomes.len() > 1;
        let efficiency = (1.0 - result.budget.tokens_used as f64 / 2000.0).max(0.0);

        MetricMap::from([
            ("task_success".to_string(), bool_metric(passed)),
            ("pass_rate".to_string(), bool_metric(passed)),
            ("first_attempt_pass".to_string(), bool_metric(first_pass)),
            ("recovery_rate".to_string(), bool_metric(recovered)),
            ("attempts".to_string(), outcomes.len() as f64),
            ("efficiency".to_string(), efficiency),
        ])
    }
}
