use tracing::{debug, warn};

use crate::{
    functions::{ToolRegistry, Tool, ToolCall, ToolCallResult},
    scenario::Scenario,
    types::ChatMessage,
};

/// Routes model-issued tool calls to the scenario's per-trial toolbox and
/// keeps the ordered record of what was dispatched.
pub struct ToolDispatcher<'a> {
    scenario: &'a dyn Scenario,
    toolbox: ToolRegistry,
    results: Vec<ToolCallResult>,
}

impl<'a> ToolDispatcher<'a> {
    pub fn new(scenario: &'a dyn Scenario) -> Self {
        Self {
            scenario,
            toolbox: scenario.toolbox(),
            results: Vec::new(),
        }
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.toolbox.tools()
    }

    pub fn into_results(self) -> Vec<ToolCallResult> {
        self.results
    }

    /// Runs `call` and returns its result with the tool message to append.
    /// The call must already carry an id.
    pub async fn dispatch(&mut self, call: &ToolCall) -> (ToolCallResult, ChatMessage) {
        let call_id = call.id.clone().unwrap_or_default();
        let result = self
            .scenario
            .handle_tool_call(&self.toolbox, &call_id, call)
            .await;

        if result.success {
            debug!(tool = %result.name, call_id = %call_id, "tool call succeeded");
        } else {
            warn!(
                tool = %result.name,
                call_id = %call_id,
                error = result.error.as_deref().unwrap_or_default(),
                "tool call failed"
            );
        }

        let message = ChatMessage::tool(call_id, result.content());
        self.results.push(result.clone());
        (result, message)
    }
}

/// Gives every call an id and pins its raw argument text, so the message
/// serializes the same way on every run.
pub fn normalize_tool_calls(message: &mut ChatMessage, turn: usize, round: usize) {
    for (i, call) in message.tool_calls.iter_mut().enumerate() {
        if call.id.as_deref().map_or(true, str::is_empty) {
            call.id = Some(format!("call_{turn}_{round}_{i}"));
        }
        if call.function.raw_arguments.is_none() {
            call.function.raw_arguments = Some(call.function.canonical_arguments());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        functions::FunctionCall,
        prompter::{Prompter, ScriptedPrompter},
        scenario::{MetricMap, ScenarioConfig, ScenarioResult, TaskFamily},
        tools::calculator::Calculator,
    };
    use serde_json::json;
    use std::sync::Arc;

    struct CalcOnly(ScenarioConfig);

    impl Scenario for CalcOnly {
        fn config(&self) -> &ScenarioConfig {
            &self.0
        }
        fn setup(&self, _seed: u64) -> Vec<ChatMessage> {
            Vec::new()
        }
        fn toolbox(&self) -> ToolRegistry {
            let mut registry = ToolRegistry::new();
            registry.register(Arc::new(Calculator));
            registry
        }
        fn prompter(&self, _seed: u64) -> Box<dyn Prompter> {
            Box::new(ScriptedPrompter::default())
        }
        fn check_termination(&self, _: &[ChatMessage], _: usize, _: u64) -> bool {
            false
        }
        fn grade(&self, _: &ScenarioResult) -> MetricMap {
            MetricMap::new()
        }
    }

    #[tokio::test]
    async fn unknown_tool_yields_structured_failure() {
        let scenario = CalcOnly(ScenarioConfig::new(TaskFamily::ToolUse, "calc", "Calc"));
        let mut dispatcher = ToolDispatcher::new(&scenario);

        let call = ToolCall::new(FunctionCall::new("teleport", json!({}))).with_id("call_1_0_0");
        let (result, message) = dispatcher.dispatch(&call).await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or_default().contains("teleport"));
        assert_eq!(message.tool_call_id.as_deref(), Some("call_1_0_0"));
        assert!(message.text().unwrap_or_default().contains("error"));
        assert_eq!(dispatcher.into_results(), vec![result]);
    }

    #[tokio::test]
    async fn known_tool_result_is_recorded() {
        let scenario = CalcOnly(ScenarioConfig::new(TaskFamily::ToolUse, "calc", "Calc"));
        let mut dispatcher = ToolDispatcher::new(&scenario);

        let call = ToolCall::new(FunctionCall::new("calculator", json!({"expression": "2 + 3"})))
            .with_id("c");
        let (result, _) = dispatcher.dispatch(&call).await;
        assert!(result.success);
        assert_eq!(result.output, Some(json!(5.0)));
    }

    #[test]
    fn normalization_assigns_ids_and_raw_arguments() {
        let mut message = ChatMessage::assistant("").with_tool_calls(vec![
            ToolCall::new(FunctionCall::new("a", json!({"x": 1}))),
            ToolCall::new(FunctionCall::new("b", json!({}))).with_id("keep"),
        ]);
        normalize_tool_calls(&mut message, 2, 1);
        assert_eq!(message.tool_calls[0].id.as_deref(), Some("call_2_1_0"));
        assert_eq!(message.tool_calls[1].id.as_deref(), Some("keep"));
        assert_eq!(message.tool_calls[0].function.raw_arguments.as_deref(), Some(r#"{"x":1}"#));
    }
}
