//! Rebuilds a trial's `ScenarioResult` from its trace alone.
//!
//! Replay never contacts a model. Tool outputs come from the stored
//! records; only tools registered as [`ReplayMode::Live`] are re-run, and
//! only to check that they still agree with the trace.

use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::{
    budget::BudgetSnapshot,
    functions::{ToolRegistry, ReplayMode},
    scenario::{Scenario, ScenarioResult, TerminationReason},
    trace::{Trace, TraceError, TurnKind, TurnRecord, TRACE_SCHEMA_VERSION},
    types::{ChatMessage, MessageRole},
};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error("unsupported trace schema version {found} (expected {expected})")]
    SchemaVersion { found: String, expected: &'static str },
    #[error("trace belongs to scenario {found}, not {expected}")]
    ScenarioMismatch { found: String, expected: String },
    #[error("record at position {position} carries index {found}")]
    OutOfOrder { position: usize, found: usize },
    #[error("trace does not start with a setup record")]
    MissingSetup,
    #[error("record {index}: {message}")]
    Inconsistent { index: usize, message: String },
    #[error("record {index}: budget snapshot breaks its limits or runs backwards")]
    Budget { index: usize },
    #[error("record {index}: live tool `{tool}` no longer reproduces its recorded output")]
    LiveToolMismatch { index: usize, tool: String },
    #[error("end of trace: {0}")]
    Footer(String),
}

fn inconsistent(index: usize, message: impl Into<String>) -> ReplayError {
    ReplayError::Inconsistent {
        index,
        message: message.into(),
    }
}

/// Reconstructs results from traces. A frozen engine trusts every stored
/// tool output; an engine bound to a scenario re-runs that scenario's live
/// tools and rejects traces they disagree with.
pub struct ReplayEngine<'a> {
    scenario: Option<&'a dyn Scenario>,
}

impl ReplayEngine<'static> {
    pub fn frozen() -> Self {
        Self { scenario: None }
    }
}

impl<'a> ReplayEngine<'a> {
    pub fn for_scenario(scenario: &'a dyn Scenario) -> Self {
        Self {
            scenario: Some(scenario),
        }
    }

    pub async fn replay_file(&self, path: &Path) -> Result<ScenarioResult, ReplayError> {
        let trace = Trace::read(path)?;
        self.replay(&trace).await
    }

    pub async fn replay(&self, trace: &Trace) -> Result<ScenarioResult, ReplayError> {
        let header = &trace.header;
        if header.schema_version != TRACE_SCHEMA_VERSION {
            return Err(ReplayError::SchemaVersion {
                found: header.schema_version.clone(),
                expected: TRACE_SCHEMA_VERSION,
            });
        }
        if let Some(scenario) = self.scenario {
            if scenario.config().id != header.scenario_id {
                return Err(ReplayError::ScenarioMismatch {
                    found: header.scenario_id.clone(),
                    expected: scenario.config().id.clone(),
                });
            }
        }

        let live_tools = self.scenario.map(|scenario| scenario.toolbox());
        let mut messages: Vec<ChatMessage> = Vec::new();
        let mut tool_calls = Vec::new();
        let mut model_errors = 0usize;
        let mut previous = BudgetSnapshot {
            token_limit: header.budget.tokens,
            turn_limit: header.budget.turns,
            ..BudgetSnapshot::default()
        };

        for (position, record) in trace.records.iter().enumerate() {
            if record.index != position {
                return Err(ReplayError::OutOfOrder {
                    position,
                    found: record.index,
                });
            }
            match (position, record.kind) {
                (0, TurnKind::Setup) => {}
                (0, _) => return Err(ReplayError::MissingSetup),
                (_, TurnKind::Setup) => return Err(inconsistent(position, "setup record after the start")),
                _ => {}
            }
            check_budget(position, &previous, &record.budget)?;

            match record.kind {
                TurnKind::Setup => {}
                TurnKind::Prompt => {
                    single_message(record, MessageRole::User)?;
                }
                TurnKind::Reply => {
                    let reply = single_message(record, MessageRole::Assistant)?;
                    if !reply.tool_calls.is_empty() {
                        return Err(inconsistent(position, "reply record carries tool calls"));
                    }
                }
                TurnKind::ToolRound => {
                    check_tool_round(record, &previous)?;
                    if let Some(tools) = &live_tools {
                        verify_live_tools(record, tools).await?;
                    }
                    tool_calls.extend(record.tool_results.iter().cloned());
                }
                TurnKind::Failure => {
                    if record.failure.is_none() || !record.messages.is_empty() {
                        return Err(inconsistent(position, "failure record must carry a failure and no messages"));
                    }
                    model_errors += 1;
                }
            }
            if record.kind != TurnKind::Failure && record.failure.is_some() {
                return Err(inconsistent(position, "unexpected failure payload"));
            }

            messages.extend(record.messages.iter().cloned());
            previous = record.budget;
        }

        if trace.records.is_empty() {
            return Err(ReplayError::MissingSetup);
        }

        let termination = match &trace.footer {
            Some(footer) => {
                if footer.records != trace.records.len() {
                    return Err(ReplayError::Footer(format!(
                        "declares {} records, found {}",
                        footer.records,
                        trace.records.len()
                    )));
                }
                if footer.budget != previous {
                    return Err(ReplayError::Footer(
                        "final budget differs from the last record".to_string(),
                    ));
                }
                footer.termination
            }
            None => {
                debug!(scenario = %header.scenario_id, seed = header.seed, "trace has no end line; treating as cancelled");
                TerminationReason::Cancelled
            }
        };

        Ok(ScenarioResult {
            scenario_id: header.scenario_id.clone(),
            seed: header.seed,
            messages,
            budget: previous,
            termination,
            tool_calls,
            model_errors,
        })
    }
}

fn check_budget(index: usize, previous: &BudgetSnapshot, current: &BudgetSnapshot) -> Result<(), ReplayError> {
    let ok = current.within_limits()
        && current.token_limit == previous.token_limit
        && current.turn_limit == previous.turn_limit
        && current.tokens_used >= previous.tokens_used
        && current.turns_used >= previous.turns_used
        && current.tool_calls >= previous.tool_calls;
    if ok {
        Ok(())
    } else {
        Err(ReplayError::Budget { index })
    }
}

fn single_message(record: &TurnRecord, role: MessageRole) -> Result<&ChatMessage, ReplayError> {
    match record.messages.as_slice() {
        [message] if message.role == role => Ok(message),
        _ => Err(inconsistent(
            record.index,
            format!("{:?} record must hold exactly one {:?} message", record.kind, role),
        )),
    }
}

fn check_tool_round(record: &TurnRecord, previous: &BudgetSnapshot) -> Result<(), ReplayError> {
    let index = record.index;
    let Some((request, responses)) = record.messages.split_first() else {
        return Err(inconsistent(index, "empty tool round"));
    };
    if request.role != MessageRole::Assistant || request.tool_calls.is_empty() {
        return Err(inconsistent(index, "tool round must open with an assistant tool request"));
    }
    let calls = &request.tool_calls;
    if responses.len() != calls.len() || record.tool_results.len() != calls.len() {
        return Err(inconsistent(
            index,
            format!(
                "{} tool calls but {} tool messages and {} results",
                calls.len(),
                responses.len(),
                record.tool_results.len()
            ),
        ));
    }
    for ((call, response), result) in calls.iter().zip(responses).zip(&record.tool_results) {
        let id = call.id.as_deref().unwrap_or_default();
        let matches = response.role == MessageRole::Tool
            && response.tool_call_id.as_deref() == Some(id)
            && result.call_id == id
            && result.name == call.function.name
            && response.content.as_deref() == Some(result.content().as_str());
        if !matches {
            return Err(inconsistent(index, format!("tool call `{id}` does not line up with its result")));
        }
    }
    if record.budget.tool_calls != previous.tool_calls + calls.len() {
        return Err(inconsistent(index, "tool-call counter does not match the round"));
    }
    Ok(())
}

async fn verify_live_tools(record: &TurnRecord, tools: &ToolRegistry) -> Result<(), ReplayError> {
    for result in &record.tool_results {
        if result.replay != ReplayMode::Live || tools.replay_mode(&result.name) != ReplayMode::Live {
            continue;
        }
        let Some(function) = tools.get(&result.name) else {
            continue;
        };
        let recomputed = function.invoke(&result.arguments).await.ok();
        let recorded = if result.success { result.output.clone() } else { None };
        if recomputed != recorded {
            return Err(ReplayError::LiveToolMismatch {
                index: record.index,
                tool: result.name.clone(),
            });
        }
    }
    Ok(())
}
