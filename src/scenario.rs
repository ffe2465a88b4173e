//! The contract every scenario family implements, and the result shape the
//! runner and the replay engine both produce.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    budget::BudgetSnapshot,
    functions::{ToolRegistry, Tool, ToolCall, ToolCallResult},
    judges::Rubric,
    prompter::Prompter,
    types::ChatMessage,
};

/// Metric name to value, ordered so serialized output is stable.
pub type MetricMap = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFamily {
    Classification,
    Constraint,
    ToolUse,
    Convergence,
}

impl TaskFamily {
    pub const ALL: [TaskFamily; 4] = [
        TaskFamily::Classification,
        TaskFamily::Constraint,
        TaskFamily::ToolUse,
        TaskFamily::Convergence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskFamily::Classification => "classification",
            TaskFamily::Constraint => "constraint",
            TaskFamily::ToolUse => "tool_use",
            TaskFamily::Convergence => "convergence",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|family| family.as_str() == value)
    }
}

impl fmt::Display for TaskFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and description of a scenario. Immutable and shared by every
/// trial of the scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// `family/name`, e.g. `constraint/json_schema`.
    pub id: String,
    pub family: TaskFamily,
    pub name: String,
    pub description: String,
}

impl ScenarioConfig {
    pub fn new(family: TaskFamily, slug: &str, name: impl Into<String>) -> Self {
        Self {
            id: format!("{}/{}", family.as_str(), slug),
            family,
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The scenario's termination check passed.
    Success,
    /// The scripted prompter had nothing more to say.
    PrompterDone,
    BudgetExhausted,
    Error,
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Success => "success",
            TerminationReason::PrompterDone => "prompter_done",
            TerminationReason::BudgetExhausted => "budget_exhausted",
            TerminationReason::Error => "error",
            TerminationReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final state of one trial. Everything grading looks at lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario_id: String,
    pub seed: u64,
    pub messages: Vec<ChatMessage>,
    pub budget: BudgetSnapshot,
    pub termination: TerminationReason,
    /// Every dispatched tool call, in dispatch order.
    pub tool_calls: Vec<ToolCallResult>,
    /// Turn-level adapter failures (exhausted retries, timeouts, malformed output).
    pub model_errors: usize,
}

impl ScenarioResult {
    pub fn tool_errors(&self) -> usize {
        self.tool_calls.iter().filter(|call| !call.success).count()
    }

    pub fn had_errors(&self) -> bool {
        self.model_errors > 0 || self.tool_errors() > 0
    }

    pub fn assistant_turns(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.is_reply())
            .count()
    }
}

/// One parameterised task definition. Implementations own no per-trial
/// state: anything mutable (prompter progress, stateful tools) is created
/// fresh for each trial through `prompter` and `toolbox`.
#[async_trait]
pub trait Scenario: Send + Sync {
    fn config(&self) -> &ScenarioConfig;

    /// Initial messages for a trial.
    fn setup(&self, seed: u64) -> Vec<ChatMessage>;

    /// Fresh tool implementations for one trial.
    fn toolbox(&self) -> ToolRegistry {
        ToolRegistry::new()
    }

    fn get_tools(&self) -> Vec<Tool> {
        self.toolbox().tools()
    }

    /// Runs one tool call against the trial's toolbox. Failures, including
    /// unknown tool names, come back as a failed result rather than an error.
    async fn handle_tool_call(&self, tools: &ToolRegistry, call_id: &str, call: &ToolCall) -> ToolCallResult {
        let replay = tools.replay_mode(&call.function.name);
        match tools.invoke(&call.function).await {
            Ok(output) => ToolCallResult::ok(call_id, &call.function, output, replay),
            Err(err) => ToolCallResult::failed(call_id, &call.function, err.to_string()),
        }
    }

    /// Scripted user side of the conversation for one trial.
    fn prompter(&self, seed: u64) -> Box<dyn Prompter>;

    fn check_termination(&self, messages: &[ChatMessage], turn: usize, tokens_used: u64) -> bool;

    /// Scenario-defined metrics. Must report the same metric names for
    /// every result.
    fn grade(&self, result: &ScenarioResult) -> MetricMap;

    /// Judge inputs, when the scenario wants ensemble scoring.
    fn rubric(&self) -> Option<Rubric> {
        None
    }
}
