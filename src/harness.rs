//! Batch orchestration: run every selected scenario for every seed against
//! one model, then grade, aggregate and write the run directory. Re-grading
//! reads that directory back and never touches a model.
//!
//! Layout of a run directory:
//!
//! ```text
//! <runs_dir>/<run_id>/
//!   manifest.json
//!   scorecard.json
//!   scorecard.md
//!   scorecard.csv
//!   scorecard-regrade-<timestamp>.json
//!   traces/<family>__<name>__seed<n>.jsonl
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::{ConfigError, HarnessConfig, ModelConfig},
    grading::{grade_trial, GradedTrial},
    judges::JudgeEnsemble,
    prompter::Prompter,
    providers::{
        limited::ConcurrencyLimited,
        mock::MockProvider,
        openai::{OpenAI, OpenAIConfig},
        scripted::ScriptedProvider,
        LLMProvider,
    },
    replay::{ReplayEngine, ReplayError},
    report::{self, ReportFormat},
    runner::Runner,
    scenario::TerminationReason,
    scenarios::{self, RegistryError},
    scorecard::Scorecard,
    trace::{trace_file_name, TraceError, TraceWriter},
    LLMError,
};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SCORECARD_FILE: &str = "scorecard.json";
pub const TRACES_DIR: &str = "traces";

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Provider(#[from] LLMError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("trial task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("run directory {0} already exists")]
    RunExists(String),
    #[error("trace refers to unknown scenario {0}")]
    UnknownScenario(String),
    #[error("every trace of run {0} failed to replay")]
    NothingToGrade(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> HarnessError + '_ {
    move |source| HarnessError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One trial as listed in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialEntry {
    pub scenario_id: String,
    pub seed: u64,
    /// Relative to the run directory.
    pub trace: PathBuf,
    pub termination: TerminationReason,
}

/// Everything re-grading needs besides the traces themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub model: String,
    pub config: HarnessConfig,
    pub cancelled: bool,
    pub trials: Vec<TrialEntry>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub dir: PathBuf,
    pub manifest: RunManifest,
    pub scorecard: Scorecard,
}

/// A trace that could not be replayed. Reported, never averaged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceFailure {
    pub trace: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct RegradeOutcome {
    pub scorecard: Scorecard,
    pub path: PathBuf,
    pub failures: Vec<TraceFailure>,
}

/// `<utc timestamp>-<8 hex chars>`, sortable by start time.
pub fn new_run_id() -> String {
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{stamp}-{}", &suffix[..8])
}

/// Adapter for `model.name`: `mock`, `scripted`, or an OpenAI-compatible
/// model id whose key is read from `model.api_key_env`.
pub fn build_provider(model: &ModelConfig) -> Result<Arc<dyn LLMProvider>, LLMError> {
    match model.name.as_str() {
        "mock" => Ok(Arc::new(MockProvider::new())),
        "scripted" => Ok(Arc::new(ScriptedProvider::from_texts(model.script.iter().cloned()))),
        _ => {
            let api_key = std::env::var(&model.api_key_env)
                .map_err(|_| LLMError::MissingApiKey(model.api_key_env.clone()))?;
            let mut config = OpenAIConfig::new(api_key);
            if let Some(base_url) = &model.base_url {
                config = config.with_base_url(base_url.clone());
            }
            Ok(Arc::new(OpenAI::from_config(config)?))
        }
    }
}

/// Ensemble used to calibrate judges: the deterministic set, with the
/// rubric judge graded by `judges.rubric_model` when one is configured.
/// The grader shares `model.base_url` and `model.api_key_env`.
pub fn calibration_ensemble(config: &HarnessConfig) -> Result<JudgeEnsemble, LLMError> {
    let judges = config.judges.clone();
    let Some(model) = judges.rubric_model.clone() else {
        return Ok(JudgeEnsemble::deterministic(judges));
    };
    let grader = build_provider(&ModelConfig {
        name: model.clone(),
        ..config.model.clone()
    })?;
    info!(model = %model, provider = grader.name(), "rubric judge graded by a model");
    Ok(JudgeEnsemble::graded(judges, grader, model))
}

pub fn run_dir(runs_dir: &Path, run_id: &str) -> PathBuf {
    runs_dir.join(run_id)
}

/// Writes a file that must not exist yet.
fn write_new(path: &Path, contents: &[u8]) -> Result<(), HarnessError> {
    let mut file = fs::File::options()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(io_error(path))?;
    file.write_all(contents).map_err(io_error(path))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), HarnessError> {
    let json = serde_json::to_string_pretty(value)?;
    write_new(path, json.as_bytes())
}

/// Creates `<runs_dir>/<run_id>/traces`, refusing a run id that is
/// already on disk.
fn create_run_dir(runs_dir: &Path, run_id: &str) -> Result<PathBuf, HarnessError> {
    fs::create_dir_all(runs_dir).map_err(io_error(runs_dir))?;
    let dir = run_dir(runs_dir, run_id);
    fs::create_dir(&dir).map_err(|source| {
        if source.kind() == std::io::ErrorKind::AlreadyExists {
            HarnessError::RunExists(dir.display().to_string())
        } else {
            io_error(&dir)(source)
        }
    })?;
    let traces_dir = dir.join(TRACES_DIR);
    fs::create_dir(&traces_dir).map_err(io_error(&traces_dir))?;
    Ok(dir)
}

pub fn load_manifest(dir: &Path) -> Result<RunManifest, HarnessError> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Err(HarnessError::RunNotFound(dir.display().to_string()));
    }
    let raw = fs::read_to_string(&path).map_err(io_error(&path))?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn load_scorecard(path: &Path) -> Result<Scorecard, HarnessError> {
    let raw = fs::read_to_string(path).map_err(io_error(path))?;
    Ok(serde_json::from_str(&raw)?)
}

/// First `scorecard-regrade-<stamp>[-n].json` not already on disk.
fn regrade_path(dir: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let mut path = dir.join(format!("scorecard-regrade-{stamp}.json"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("scorecard-regrade-{stamp}-{n}.json"));
        n += 1;
    }
    path
}

fn sort_trials(trials: &mut [(TrialEntry, GradedTrial)]) {
    trials.sort_by(|(a, _), (b, _)| a.scenario_id.cmp(&b.scenario_id).then(a.seed.cmp(&b.seed)));
}

pub struct Harness {
    config: HarnessConfig,
    cancel: CancellationToken,
}

impl Harness {
    pub fn new(mut config: HarnessConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancelling the token stops scheduling new trials and ends running
    /// ones after their current call; their traces stay replayable.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub async fn run(&self, provider: Arc<dyn LLMProvider>) -> Result<RunOutcome, HarnessError> {
        self.run_with_id(&new_run_id(), provider).await
    }

    pub async fn run_with_id(&self, run_id: &str, provider: Arc<dyn LLMProvider>) -> Result<RunOutcome, HarnessError> {
        let config = &self.config;
        let selected = scenarios::resolve(config.scenarios.as_slice())?;
        let dir = create_run_dir(&config.runs_dir, run_id)?;

        info!(
            run_id,
            model = %config.model.name,
            scenarios = selected.len(),
            seeds = config.seeds,
            "starting run"
        );

        let provider: Arc<dyn LLMProvider> =
            Arc::new(ConcurrencyLimited::new(provider, config.runner.concurrency));
        let runner = Arc::new(self.runner(run_id));
        let ensemble = Arc::new(JudgeEnsemble::deterministic(config.judges.clone()));
        let slots = Arc::new(Semaphore::new(config.runner.concurrency));
        let mut join_set = JoinSet::new();

        'schedule: for scenario in &selected {
            for seed in 0..config.seeds {
                let permit = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break 'schedule,
                    permit = Arc::clone(&slots).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'schedule,
                    },
                };
                let scenario = Arc::clone(scenario);
                let provider = Arc::clone(&provider);
                let runner = Arc::clone(&runner);
                let ensemble = Arc::clone(&ensemble);
                let relative = PathBuf::from(TRACES_DIR).join(trace_file_name(&scenario.config().id, seed));
                let path = dir.join(&relative);

                join_set.spawn(async move {
                    let _permit = permit;
                    let writer = TraceWriter::create(path)?;
                    let execution = runner
                        .execute_to(scenario.as_ref(), provider.as_ref(), seed, Some(writer))
                        .await?;
                    let graded = grade_trial(scenario.as_ref(), &execution.result, &ensemble).await;
                    let entry = TrialEntry {
                        scenario_id: scenario.config().id.clone(),
                        seed,
                        trace: relative,
                        termination: execution.result.termination,
                    };
                    Ok::<_, HarnessError>((entry, graded))
                });
            }
        }

        let mut finished = Vec::new();
        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined.map_err(HarnessError::from).and_then(|trial| trial) {
                Ok(trial) => finished.push(trial),
                Err(err) => {
                    error!(error = %err, "trial failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        self.finish(run_id, dir, finished)
    }

    /// One seed-0 trial of `scenario_id` with `prompter` playing the user.
    /// The run directory has the usual layout, so it can be re-graded.
    pub async fn run_interactive(
        &self,
        run_id: &str,
        scenario_id: &str,
        provider: Arc<dyn LLMProvider>,
        prompter: Box<dyn Prompter>,
    ) -> Result<RunOutcome, HarnessError> {
        let scenario =
            scenarios::create(scenario_id).ok_or_else(|| HarnessError::UnknownScenario(scenario_id.to_string()))?;
        let dir = create_run_dir(&self.config.runs_dir, run_id)?;
        info!(run_id, scenario = scenario_id, model = %self.config.model.name, "starting interactive trial");

        let seed = 0;
        let relative = PathBuf::from(TRACES_DIR).join(trace_file_name(scenario_id, seed));
        let writer = TraceWriter::create(dir.join(&relative))?;
        let execution = self
            .runner(run_id)
            .execute_with_prompter(scenario.as_ref(), provider.as_ref(), seed, prompter, Some(writer))
            .await?;
        let ensemble = JudgeEnsemble::deterministic(self.config.judges.clone());
        let graded = grade_trial(scenario.as_ref(), &execution.result, &ensemble).await;
        let entry = TrialEntry {
            scenario_id: scenario_id.to_string(),
            seed,
            trace: relative,
            termination: execution.result.termination,
        };
        self.finish(run_id, dir, vec![(entry, graded)])
    }

    fn runner(&self, run_id: &str) -> Runner {
        let config = &self.config;
        Runner::new(run_id, config.model.name.clone(), config.budget)
            .with_settings(config.runner.clone())
            .with_temperature(config.model.temperature)
            .with_max_tokens(config.model.max_tokens)
            .with_cancellation(self.cancel.clone())
    }

    /// Writes the manifest, the scorecard and its renderings.
    fn finish(
        &self,
        run_id: &str,
        dir: PathBuf,
        mut finished: Vec<(TrialEntry, GradedTrial)>,
    ) -> Result<RunOutcome, HarnessError> {
        let config = &self.config;
        sort_trials(&mut finished);

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            warn!(run_id, completed = finished.len(), "run cancelled; partial traces kept");
        }
        let (entries, graded): (Vec<TrialEntry>, Vec<GradedTrial>) = finished.into_iter().unzip();
        let manifest = RunManifest {
            run_id: run_id.to_string(),
            model: config.model.name.clone(),
            config: config.clone(),
            cancelled,
            trials: entries,
        };
        write_json(&dir.join(MANIFEST_FILE), &manifest)?;

        let scorecard = Scorecard::build(run_id, &manifest.model, &graded, &config.scoring);
        write_json(&dir.join(SCORECARD_FILE), &scorecard)?;
        for format in [ReportFormat::Markdown, ReportFormat::Csv] {
            let rendered = report::render(&scorecard, format)?;
            write_new(&dir.join(format!("scorecard.{}", format.extension())), rendered.as_bytes())?;
        }

        info!(run_id, trials = graded.len(), composite = scorecard.composite_score, "run complete");
        Ok(RunOutcome {
            run_id: run_id.to_string(),
            dir,
            manifest,
            scorecard,
        })
    }
}

/// Re-derives the scorecard of a finished run from its traces alone and
/// writes it to a new file beside the original. Traces that fail to
/// replay are reported in the outcome and left out of the scorecard.
pub async fn regrade(runs_dir: &Path, run_id: &str) -> Result<RegradeOutcome, HarnessError> {
    let dir = run_dir(runs_dir, run_id);
    let manifest = load_manifest(&dir)?;
    let ensemble = JudgeEnsemble::deterministic(manifest.config.judges.clone());

    let mut graded = Vec::with_capacity(manifest.trials.len());
    let mut failures = Vec::new();
    for trial in &manifest.trials {
        let scenario = scenarios::create(&trial.scenario_id)
            .ok_or_else(|| HarnessError::UnknownScenario(trial.scenario_id.clone()))?;
        let replayed = ReplayEngine::for_scenario(scenario.as_ref())
            .replay_file(&dir.join(&trial.trace))
            .await;
        match replayed {
            Ok(result) => graded.push(grade_trial(scenario.as_ref(), &result, &ensemble).await),
            Err(err) => {
                warn!(trace = %trial.trace.display(), error = %err, "trace failed to replay");
                failures.push(TraceFailure {
                    trace: trial.trace.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    if graded.is_empty() && !manifest.trials.is_empty() {
        return Err(HarnessError::NothingToGrade(run_id.to_string()));
    }

    let scorecard = Scorecard::build(run_id, &manifest.model, &graded, &manifest.config.scoring);
    let path = regrade_path(&dir);
    write_json(&path, &scorecard)?;
    info!(run_id, path = %path.display(), failures = failures.len(), "regraded run");
    Ok(RegradeOutcome {
        scorecard,
        path,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique_and_timestamped() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), "20260101-000000-".len() + 8);
    }

    #[test]
    fn unknown_models_need_an_api_key() {
        let model = ModelConfig {
            name: "gpt-test".to_string(),
            api_key_env: "GAUNTLET_TEST_UNSET_KEY".to_string(),
            ..ModelConfig::default()
        };
        assert!(matches!(build_provider(&model), Err(LLMError::MissingApiKey(_))));
        assert_eq!(build_provider(&ModelConfig::default()).map(|p| p.name()).ok(), Some("mock"));
    }

    #[test]
    fn calibration_uses_the_configured_rubric_grader() {
        let mut config = HarnessConfig::default();
        let plain = calibration_ensemble(&config).expect("ensemble");
        assert_eq!(plain.judges().len(), 3);

        config.judges.rubric_model = Some("mock".to_string());
        let graded = calibration_ensemble(&config).expect("graded ensemble");
        assert_eq!(graded.judges().len(), 3);
        assert!(graded.is_deterministic());

        config.judges.rubric_model = Some("gpt-test".to_string());
        config.model.api_key_env = "GAUNTLET_TEST_UNSET_KEY".to_string();
        assert!(matches!(calibration_ensemble(&config), Err(LLMError::MissingApiKey(_))));
    }

    #[test]
    fn regrade_never_overwrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = regrade_path(dir.path());
        fs::write(&first, "{}").expect("write");
        let second = regrade_path(dir.path());
        assert_ne!(first, second);
    }

    #[test]
    fn run_directories_are_never_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runs = dir.path().join("runs");
        let created = create_run_dir(&runs, "r1").expect("first");
        assert!(created.join(TRACES_DIR).is_dir());
        assert!(matches!(create_run_dir(&runs, "r1"), Err(HarnessError::RunExists(_))));

        let manifest = created.join(MANIFEST_FILE);
        write_new(&manifest, b"{}").expect("write");
        assert!(matches!(write_new(&manifest, b"[]"), Err(HarnessError::Io { .. })));
        assert_eq!(fs::read_to_string(&manifest).expect("read"), "{}");
    }

    #[tokio::test]
    async fn missing_run_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            regrade(dir.path(), "nope").await,
            Err(HarnessError::RunNotFound(_))
        ));
    }
}
