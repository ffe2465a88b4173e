pub mod error;
pub mod providers;
pub mod types;
pub mod functions;
pub mod text;
pub mod tools;
pub mod budget;
pub mod prompter;
pub mod dispatch;
pub mod scenario;
pub mod scenarios;
pub mod trace;
pub mod runner;
pub mod replay;
pub mod judges;
pub mod grading;
pub mod stats;
pub mod pareto;
pub mod scorecard;
pub mod report;
pub mod config;
pub mod harness;

pub use error::{FailureClass, LLMError};
pub use providers::LLMProvider;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use functions::{
    DynToolFunction, FunctionCall, FunctionDefinition, FunctionParameter, ToolRegistry, ToolFunction,
    ReplayMode, Tool, ToolCall, ToolCallResult, ToolChoice,
};
pub use budget::{Budget, BudgetConfig, BudgetSnapshot};
pub use prompter::{HumanPrompter, Prompter, ScriptedPrompter};
pub use scenario::{MetricMap, Scenario, ScenarioConfig, ScenarioResult, TaskFamily, TerminationReason};
pub use trace::{Trace, TraceError, TraceRecorder, TraceWriter};
pub use runner::{Execution, Runner, RunnerConfig};
pub use replay::{ReplayEngine, ReplayError};
pub use judges::{EnsembleConfig, JudgeEnsemble, JudgeVerdict, Rubric};
pub use grading::{grade_trial, GradedTrial};
pub use stats::{AggregationError, MetricStats, PercentileMethod};
pub use pareto::{Direction, Objective, ParetoEntry};
pub use scorecard::Scorecard;
pub use config::{ConfigError, HarnessConfig};
pub use harness::{Harness, HarnessError};
pub use schemars::JsonSchema;
