use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    budget::{estimate_message_tokens, Budget, BudgetConfig},
    dispatch::{normalize_tool_calls, ToolDispatcher},
    error::FailureClass,
    functions::{Tool, ToolChoice},
    prompter::Prompter,
    providers::LLMProvider,
    scenario::{Scenario, ScenarioResult, TerminationReason},
    trace::{Trace, TraceError, TraceHeader, TraceRecorder, TraceWriter, TurnFailure, TurnKind, TRACE_SCHEMA_VERSION},
    types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole},
    LLMError,
};

fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_consecutive_failure_limit() -> usize {
    3
}
fn default_malformed_limit() -> usize {
    3
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_max_tool_rounds() -> usize {
    8
}
fn default_concurrency() -> usize {
    4
}

/// Failure handling and scheduling knobs for the turn loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Retries for a transient adapter failure before it becomes a turn failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// A trial aborts once more than this many turn failures happen in a row.
    #[serde(default = "default_consecutive_failure_limit")]
    pub consecutive_failure_limit: usize,
    /// A trial aborts once more than this many malformed responses arrive.
    #[serde(default = "default_malformed_limit")]
    pub malformed_limit: usize,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Consecutive tool-call rounds allowed before the model must answer.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Trials scheduled at once; also bounds in-flight adapter calls.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            consecutive_failure_limit: default_consecutive_failure_limit(),
            malformed_limit: default_malformed_limit(),
            call_timeout_ms: default_call_timeout_ms(),
            max_tool_rounds: default_max_tool_rounds(),
            concurrency: default_concurrency(),
        }
    }
}

/// A finished trial: its result and the trace it was recorded into.
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: ScenarioResult,
    pub trace: Trace,
}

/// Drives the turn loop for one scenario and seed at a time.
#[derive(Debug, Clone)]
pub struct Runner {
    run_id: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    budget: BudgetConfig,
    settings: RunnerConfig,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(run_id: impl Into<String>, model: impl Into<String>, budget: BudgetConfig) -> Self {
        Self {
            run_id: run_id.into(),
            model: model.into(),
            temperature: 0.0,
            max_tokens: None,
            budget,
            settings: RunnerConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: RunnerConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn settings(&self) -> &RunnerConfig {
        &self.settings
    }

    /// Runs one trial, keeping the trace in memory only.
    pub async fn execute(
        &self,
        scenario: &dyn Scenario,
        provider: &dyn LLMProvider,
        seed: u64,
    ) -> Result<Execution, TraceError> {
        self.execute_to(scenario, provider, seed, None).await
    }

    /// Runs one trial, streaming each trace record to `writer` as it is
    /// accepted. Adapter and tool failures never surface as errors here;
    /// they end up in the trace and the termination reason.
    pub async fn execute_to(
        &self,
        scenario: &dyn Scenario,
        provider: &dyn LLMProvider,
        seed: u64,
        writer: Option<TraceWriter>,
    ) -> Result<Execution, TraceError> {
        self.execute_with_prompter(scenario, provider, seed, scenario.prompter(seed), writer)
            .await
    }

    /// Runs one trial with the user side supplied by `prompter` instead of
    /// the scenario's own policy, e.g. a person at a terminal.
    pub async fn execute_with_prompter(
        &self,
        scenario: &dyn Scenario,
        provider: &dyn LLMProvider,
        seed: u64,
        prompter: Box<dyn Prompter>,
        writer: Option<TraceWriter>,
    ) -> Result<Execution, TraceError> {
        let span = info_span!("trial", scenario = %scenario.config().id, seed);
        self.run_trial(scenario, provider, seed, prompter, writer).instrument(span).await
    }

    async fn run_trial(
        &self,
        scenario: &dyn Scenario,
        provider: &dyn LLMProvider,
        seed: u64,
        mut prompter: Box<dyn Prompter>,
        writer: Option<TraceWriter>,
    ) -> Result<Execution, TraceError> {
        let header = TraceHeader {
            schema_version: TRACE_SCHEMA_VERSION.to_string(),
            run_id: self.run_id.clone(),
            scenario_id: scenario.config().id.clone(),
            seed,
            model: format!("{}:{}", provider.name(), self.model),
            budget: self.budget,
        };

        let dispatcher = ToolDispatcher::new(scenario);
        let mut trial = Trial {
            runner: self,
            scenario,
            provider,
            seed,
            tools: dispatcher.tools(),
            dispatcher,
            messages: scenario.setup(seed),
            budget: Budget::new(self.budget),
            recorder: TraceRecorder::new(header, writer)?,
            consecutive_failures: 0,
            malformed: 0,
            model_errors: 0,
        };
        trial.recorder.record(
            0,
            TurnKind::Setup,
            trial.messages.clone(),
            Vec::new(),
            None,
            trial.budget.snapshot(),
        )?;

        let mut prompts_sent = 0usize;
        let mut awaiting_reply = false;

        let termination = loop {
            if self.cancel.is_cancelled() {
                break TerminationReason::Cancelled;
            }
            if trial.budget.turns_exhausted() {
                break TerminationReason::BudgetExhausted;
            }
            let turn = trial.budget.turns_used() + 1;

            // after a failed call the pending user message is retried as is
            if !awaiting_reply {
                let Some(text) = prompter.next_message(&trial.messages, prompts_sent) else {
                    break TerminationReason::PrompterDone;
                };
                let prompt = ChatMessage::user(text);
                trial.messages.push(prompt.clone());
                prompts_sent += 1;
                trial.recorder.record(
                    turn,
                    TurnKind::Prompt,
                    vec![prompt],
                    Vec::new(),
                    None,
                    trial.budget.snapshot(),
                )?;
                awaiting_reply = true;
            }

            match trial.respond(turn).await? {
                Step::Replied => {
                    awaiting_reply = false;
                    if scenario.check_termination(
                        &trial.messages,
                        trial.budget.turns_used(),
                        trial.budget.tokens_used(),
                    ) {
                        break TerminationReason::Success;
                    }
                }
                Step::Done(reason) => break reason,
                Step::Failed(err) => {
                    if let Some(reason) = trial.record_failure(turn, err)? {
                        break reason;
                    }
                }
            }
        };

        let snapshot = trial.budget.snapshot();
        let trace = trial.recorder.finish(termination, snapshot)?;
        info!(
            termination = %termination,
            tokens_used = snapshot.tokens_used,
            turns_used = snapshot.turns_used,
            tool_calls = snapshot.tool_calls,
            "trial finished"
        );

        let result = ScenarioResult {
            scenario_id: scenario.config().id.clone(),
            seed,
            messages: trial.messages,
            budget: snapshot,
            termination,
            tool_calls: trial.dispatcher.into_results(),
            model_errors: trial.model_errors,
        };
        Ok(Execution { result, trace })
    }

    /// One adapter call with a per-attempt timeout and bounded retries of
    /// transient failures.
    async fn call_model(
        &self,
        provider: &dyn LLMProvider,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LLMError> {
        let timeout = Duration::from_millis(self.settings.call_timeout_ms);
        let mut delay = Duration::from_millis(self.settings.retry_backoff_ms);
        let mut attempt = 0u32;

        loop {
            let outcome = match time::timeout(timeout, provider.complete(request.clone())).await {
                Ok(outcome) => outcome,
                Err(_) => Err(LLMError::Timeout(self.settings.call_timeout_ms)),
            };
            match outcome {
                Err(err) if err.is_transient() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    debug!(attempt, error = %err, "retrying transient adapter failure");
                    if !delay.is_zero() {
                        time::sleep(delay).await;
                    }
                    delay = delay.mul_f64(self.settings.backoff_multiplier.max(1.0));
                }
                other => return other,
            }
        }
    }
}

enum Step {
    Replied,
    Done(TerminationReason),
    Failed(LLMError),
}

/// Mutable state of one trial. Dropped once the trial terminates.
struct Trial<'a> {
    runner: &'a Runner,
    scenario: &'a dyn Scenario,
    provider: &'a dyn LLMProvider,
    seed: u64,
    tools: Vec<Tool>,
    dispatcher: ToolDispatcher<'a>,
    messages: Vec<ChatMessage>,
    budget: Budget,
    recorder: TraceRecorder,
    consecutive_failures: usize,
    malformed: usize,
    model_errors: usize,
}

impl<'a> Trial<'a> {
    fn request(&self) -> CompletionRequest {
        let mut request = CompletionRequest::new(self.runner.model.clone(), self.messages.clone())
            .with_temperature(self.runner.temperature)
            .with_seed(self.seed);
        if let Some(max_tokens) = self.runner.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if !self.tools.is_empty() {
            request = request
                .with_tools(self.tools.iter().cloned())
                .with_tool_choice(ToolChoice::Auto);
        }
        request
    }

    /// Gets the model's answer to the current conversation, dispatching
    /// tool-call rounds until it answers in prose.
    async fn respond(&mut self, turn: usize) -> Result<Step, TraceError> {
        let runner = self.runner;
        let provider = self.provider;
        let mut round = 0usize;

        loop {
            let request = self.request();
            let outcome = tokio::select! {
                biased;
                _ = runner.cancel.cancelled() => return Ok(Step::Done(TerminationReason::Cancelled)),
                outcome = runner.call_model(provider, request) => outcome,
            };
            let mut reply = match outcome {
                Ok(response) => response.message,
                Err(err) => return Ok(Step::Failed(err)),
            };
            self.consecutive_failures = 0;
            reply.role = MessageRole::Assistant;

            if reply.tool_calls.is_empty() {
                let cost = estimate_message_tokens(&reply);
                if !self.budget.try_accept(cost, true) {
                    info!(cost, tokens_used = self.budget.tokens_used(), "reply does not fit the budget");
                    return Ok(Step::Done(TerminationReason::BudgetExhausted));
                }
                self.messages.push(reply.clone());
                self.recorder.record(
                    turn,
                    TurnKind::Reply,
                    vec![reply],
                    Vec::new(),
                    None,
                    self.budget.snapshot(),
                )?;
                return Ok(Step::Replied);
            }

            if round >= runner.settings.max_tool_rounds {
                return Ok(Step::Failed(LLMError::MalformedResponse(format!(
                    "model kept calling tools after {round} rounds"
                ))));
            }

            normalize_tool_calls(&mut reply, turn, round);
            let cost = estimate_message_tokens(&reply);
            let consumes_turn = self.budget.config().count_tool_turns;
            if !self.budget.try_accept(cost, consumes_turn) {
                info!(cost, tokens_used = self.budget.tokens_used(), "tool round does not fit the budget");
                return Ok(Step::Done(TerminationReason::BudgetExhausted));
            }

            let mut appended = vec![reply.clone()];
            let mut results = Vec::with_capacity(reply.tool_calls.len());
            for call in &reply.tool_calls {
                let (result, message) = self.dispatcher.dispatch(call).await;
                appended.push(message);
                results.push(result);
            }
            self.budget.record_tool_calls(results.len());
            self.messages.extend(appended.iter().cloned());
            self.recorder.record(
                turn,
                TurnKind::ToolRound,
                appended,
                results,
                None,
                self.budget.snapshot(),
            )?;

            if self.scenario.check_termination(
                &self.messages,
                self.budget.turns_used(),
                self.budget.tokens_used(),
            ) {
                return Ok(Step::Done(TerminationReason::Success));
            }
            if consumes_turn && self.budget.turns_exhausted() {
                return Ok(Step::Done(TerminationReason::BudgetExhausted));
            }
            round += 1;
        }
    }

    /// Records a failed adapter call; returns the termination reason when
    /// the failure ends the trial.
    fn record_failure(&mut self, turn: usize, err: LLMError) -> Result<Option<TerminationReason>, TraceError> {
        let class = err.class();
        self.model_errors += 1;
        self.consecutive_failures += 1;
        warn!(turn, error = %err, ?class, "adapter call failed");

        self.recorder.record(
            turn,
            TurnKind::Failure,
            Vec::new(),
            Vec::new(),
            Some(TurnFailure {
                kind: class.into(),
                message: err.to_string(),
            }),
            self.budget.snapshot(),
        )?;

        let limits = &self.runner.settings;
        let abort = match class {
            FailureClass::Fatal => true,
            FailureClass::Malformed => {
                self.malformed += 1;
                self.malformed > limits.malformed_limit
            }
            FailureClass::Transient => false,
        } || self.consecutive_failures > limits.consecutive_failure_limit;

        Ok(abort.then_some(TerminationReason::Error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        judges::Rubric,
        prompter::{HumanPrompter, ScriptedPrompter},
        providers::scripted::{ScriptedProvider, ScriptedReply},
        replay::ReplayEngine,
        scenario::{MetricMap, ScenarioConfig, TaskFamily},
    };

    /// Asks fixed questions; succeeds once the model says "done".
    struct Echo {
        config: ScenarioConfig,
        prompts: Vec<&'static str>,
    }

    impl Echo {
        fn new(prompts: Vec<&'static str>) -> Self {
            Self {
                config: ScenarioConfig::new(TaskFamily::Convergence, "echo", "Echo"),
                prompts,
            }
        }
    }

    impl Scenario for Echo {
        fn config(&self) -> &ScenarioConfig {
            &self.config
        }
        fn setup(&self, _seed: u64) -> Vec<ChatMessage> {
            vec![ChatMessage::system("echo")]
        }
        fn prompter(&self, _seed: u64) -> Box<dyn Prompter> {
            Box::new(ScriptedPrompter::new(self.prompts.clone()))
        }
        fn check_termination(&self, messages: &[ChatMessage], _turn: usize, _tokens: u64) -> bool {
            crate::types::final_assistant_text(messages) == Some("done")
        }
        fn grade(&self, _result: &ScenarioResult) -> MetricMap {
            MetricMap::new()
        }
        fn rubric(&self) -> Option<Rubric> {
            None
        }
    }

    fn fast() -> RunnerConfig {
        RunnerConfig {
            retry_backoff_ms: 0,
            ..RunnerConfig::default()
        }
    }

    #[tokio::test]
    async fn stops_when_termination_check_passes() {
        let scenario = Echo::new(vec!["a", "b", "c"]);
        let provider = ScriptedProvider::from_texts(["working", "done", "unused"]);
        let runner = Runner::new("r", "m", BudgetConfig::default()).with_settings(fast());

        let run = runner.execute(&scenario, &provider, 0).await.expect("execute");
        assert_eq!(run.result.termination, TerminationReason::Success);
        assert_eq!(run.result.budget.turns_used, 2);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_recorded() {
        let scenario = Echo::new(vec!["a"]);
        let provider = ScriptedProvider::new([
            ScriptedReply::Transient("blip".into()),
            ScriptedReply::Transient("blip".into()),
            ScriptedReply::Transient("blip".into()),
            ScriptedReply::text("done"),
        ]);
        let runner = Runner::new("r", "m", BudgetConfig::default()).with_settings(fast());

        let run = runner.execute(&scenario, &provider, 0).await.expect("execute");
        // two retries exhausted, one failure recorded, then the pending prompt succeeds
        assert_eq!(run.result.model_errors, 1);
        assert_eq!(run.result.termination, TerminationReason::Success);
        assert!(run.trace.records.iter().any(|r| r.kind == TurnKind::Failure));
    }

    #[tokio::test]
    async fn fatal_failure_aborts_with_error() {
        let scenario = Echo::new(vec!["a", "b"]);
        let provider = ScriptedProvider::new([
            ScriptedReply::text("fine"),
            ScriptedReply::Fatal("bad key".into()),
        ]);
        let runner = Runner::new("r", "m", BudgetConfig::default()).with_settings(fast());

        let run = runner.execute(&scenario, &provider, 0).await.expect("execute");
        assert_eq!(run.result.termination, TerminationReason::Error);
        assert_eq!(run.result.assistant_turns(), 1);
        assert!(run.trace.footer.is_some());
    }

    #[tokio::test]
    async fn repeated_malformed_output_aborts() {
        let scenario = Echo::new(vec!["a"]);
        let provider = ScriptedProvider::new(
            (0..10).map(|_| ScriptedReply::Malformed("garbage".into())),
        );
        let settings = RunnerConfig {
            malformed_limit: 1,
            ..fast()
        };
        let runner = Runner::new("r", "m", BudgetConfig::default()).with_settings(settings);

        let run = runner.execute(&scenario, &provider, 0).await.expect("execute");
        assert_eq!(run.result.termination, TerminationReason::Error);
        assert_eq!(run.result.model_errors, 2);
    }

    #[tokio::test]
    async fn slow_calls_time_out_as_turn_failures() {
        let scenario = Echo::new(vec!["a"]);
        let provider = ScriptedProvider::new([
            ScriptedReply::Delayed(Duration::from_millis(200), "late".into()),
            ScriptedReply::text("done"),
        ]);
        let settings = RunnerConfig {
            call_timeout_ms: 20,
            max_retries: 0,
            ..fast()
        };
        let runner = Runner::new("r", "m", BudgetConfig::default()).with_settings(settings);

        let run = runner.execute(&scenario, &provider, 0).await.expect("execute");
        assert_eq!(run.result.model_errors, 1);
        assert_eq!(run.result.termination, TerminationReason::Success);
        let failure = run
            .trace
            .records
            .iter()
            .find_map(|r| r.failure.clone())
            .expect("failure record");
        assert!(failure.message.contains("timed out"));
    }

    #[tokio::test]
    async fn prompter_running_dry_ends_the_trial() {
        let scenario = Echo::new(vec!["only"]);
        let provider = ScriptedProvider::from_texts(["not yet"]);
        let runner = Runner::new("r", "m", BudgetConfig::default()).with_settings(fast());

        let run = runner.execute(&scenario, &provider, 0).await.expect("execute");
        assert_eq!(run.result.termination, TerminationReason::PrompterDone);
    }

    #[tokio::test]
    async fn cancelled_runner_records_cancellation() {
        let scenario = Echo::new(vec!["a"]);
        let provider = ScriptedProvider::from_texts(["done"]);
        let token = CancellationToken::new();
        token.cancel();
        let runner = Runner::new("r", "m", BudgetConfig::default())
            .with_settings(fast())
            .with_cancellation(token);

        let run = runner.execute(&scenario, &provider, 0).await.expect("execute");
        assert_eq!(run.result.termination, TerminationReason::Cancelled);
        assert_eq!(provider.calls(), 0);
        assert_eq!(run.trace.records.len(), 1);
    }

    #[tokio::test]
    async fn cancelling_mid_trial_keeps_completed_turns_replayable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("echo.jsonl");
        let scenario = Echo::new(vec!["a", "b", "c"]);
        let provider = ScriptedProvider::new([
            ScriptedReply::text("first"),
            ScriptedReply::Delayed(Duration::from_secs(60), "never seen".into()),
        ]);
        let token = CancellationToken::new();
        let runner = Runner::new("r", "m", BudgetConfig::default())
            .with_settings(fast())
            .with_cancellation(token.clone());
        let writer = TraceWriter::create(&path).expect("writer");

        // cancel while the second call is in flight
        let cancel_during_second_call = async {
            while provider.calls() < 2 {
                time::sleep(Duration::from_millis(1)).await;
            }
            token.cancel();
        };
        let (run, ()) = tokio::join!(
            runner.execute_to(&scenario, &provider, 0, Some(writer)),
            cancel_during_second_call
        );
        let run = run.expect("execute");
        assert_eq!(run.result.termination, TerminationReason::Cancelled);
        let kinds: Vec<TurnKind> = run.trace.records.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, [TurnKind::Setup, TurnKind::Prompt, TurnKind::Reply, TurnKind::Prompt]);

        let replayed = ReplayEngine::for_scenario(&scenario)
            .replay_file(&path)
            .await
            .expect("replay");
        assert_eq!(replayed, run.result);
        assert_eq!(crate::types::final_assistant_text(&replayed.messages), Some("first"));
        assert_eq!(replayed.budget.turns_used, 1);

        // a process killed before the end line still replays up to the last record
        let raw = std::fs::read_to_string(&path).expect("raw");
        let without_end: Vec<&str> = raw.lines().filter(|line| !line.contains("\"type\":\"end\"")).collect();
        assert_eq!(without_end.len(), raw.lines().count() - 1);
        std::fs::write(&path, without_end.join("\n") + "\n").expect("truncate");
        let truncated = ReplayEngine::for_scenario(&scenario)
            .replay_file(&path)
            .await
            .expect("replay without end line");
        assert_eq!(truncated.termination, TerminationReason::Cancelled);
        assert_eq!(truncated.messages, run.result.messages);
    }

    #[tokio::test]
    async fn external_prompter_replaces_the_scripted_policy() {
        let scenario = Echo::new(vec!["scripted"]);
        let provider = ScriptedProvider::from_texts(["hello", "done"]);
        let runner = Runner::new("r", "m", BudgetConfig::default()).with_settings(fast());
        let human = HumanPrompter::new(std::io::Cursor::new("hi there\nwrap up\n"), Vec::new());

        let run = runner
            .execute_with_prompter(&scenario, &provider, 0, Box::new(human), None)
            .await
            .expect("execute");
        assert_eq!(run.result.termination, TerminationReason::Success);
        let prompts: Vec<&str> = run
            .result
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .filter_map(ChatMessage::text)
            .collect();
        assert_eq!(prompts, ["hi there", "wrap up"]);
    }
}
