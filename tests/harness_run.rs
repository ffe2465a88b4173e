use std::fs;
use std::io::Cursor;
use std::sync::Arc;

use gauntlet::{
    config::HarnessConfig,
    harness::{self, Harness, HarnessError, MANIFEST_FILE, SCORECARD_FILE},
    prompter::HumanPrompter,
    providers::mock::MockProvider,
    Scorecard,
};
use tokio_util::sync::CancellationToken;

fn config(runs_dir: &std::path::Path) -> HarnessConfig {
    HarnessConfig {
        seeds: 2,
        runs_dir: runs_dir.to_path_buf(),
        ..HarnessConfig::default()
    }
}

#[tokio::test]
async fn regrading_reproduces_the_run_scorecard() {
    let dir = tempfile::tempdir().expect("tempdir");
    let harness = Harness::new(config(dir.path())).expect("config");

    let outcome = harness
        .run_with_id("run-a", Arc::new(MockProvider::new()))
        .await
        .expect("run");
    assert_eq!(outcome.manifest.trials.len(), 4 * 2);
    assert!(!outcome.manifest.cancelled);
    assert_eq!(outcome.scorecard.entries.len(), 4);
    assert!(outcome.scorecard.entries.iter().all(|e| e.seeds_run == 2));
    assert!(outcome.dir.join(MANIFEST_FILE).exists());
    assert!(outcome.dir.join("scorecard.md").exists());
    let csv = fs::read_to_string(outcome.dir.join("scorecard.csv")).expect("csv");
    assert_eq!(csv.lines().count(), 1 + 4);
    assert!(outcome.scorecard.failures.is_empty());

    let original = fs::read_to_string(outcome.dir.join(SCORECARD_FILE)).expect("scorecard");
    let regrade = harness::regrade(dir.path(), "run-a").await.expect("regrade");
    assert!(regrade.failures.is_empty());
    assert_ne!(regrade.path, outcome.dir.join(SCORECARD_FILE));
    assert_eq!(regrade.scorecard, outcome.scorecard);

    let written = fs::read_to_string(&regrade.path).expect("regrade file");
    assert_eq!(written, original);
    let untouched = fs::read_to_string(outcome.dir.join(SCORECARD_FILE)).expect("scorecard");
    assert_eq!(untouched, original);

    let parsed: Scorecard = serde_json::from_str(&written).expect("parse");
    assert_eq!(parsed.run_id, "run-a");
}

#[tokio::test]
async fn corrupted_traces_are_reported_not_averaged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config(dir.path());
    config.scenarios = vec!["constraint".to_string()];
    let harness = Harness::new(config).expect("config");
    let outcome = harness
        .run_with_id("run-b", Arc::new(MockProvider::new()))
        .await
        .expect("run");

    let broken = outcome.dir.join(&outcome.manifest.trials[1].trace);
    fs::write(&broken, "{\"type\":\"header\"\n").expect("corrupt");

    let regrade = harness::regrade(dir.path(), "run-b").await.expect("regrade");
    assert_eq!(regrade.failures.len(), 1);
    assert_eq!(regrade.scorecard.entries[0].seeds_run, 1);
}

#[tokio::test]
async fn reusing_a_run_id_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config(dir.path());
    config.scenarios = vec!["constraint".to_string()];
    let harness = Harness::new(config).expect("config");
    let first = harness
        .run_with_id("run-d", Arc::new(MockProvider::new()))
        .await
        .expect("first run");
    let scorecard = fs::read_to_string(first.dir.join(SCORECARD_FILE)).expect("scorecard");
    let trace = first.dir.join(&first.manifest.trials[0].trace);
    let trace_bytes = fs::read(&trace).expect("trace");

    let second = harness.run_with_id("run-d", Arc::new(MockProvider::new())).await;
    assert!(matches!(second, Err(HarnessError::RunExists(_))));
    assert_eq!(fs::read_to_string(first.dir.join(SCORECARD_FILE)).expect("scorecard"), scorecard);
    assert_eq!(fs::read(&trace).expect("trace"), trace_bytes);
}

#[tokio::test]
async fn cancelled_runs_still_write_a_manifest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cancel = CancellationToken::new();
    cancel.cancel();
    let harness = Harness::new(config(dir.path()))
        .expect("config")
        .with_cancellation(cancel);

    let outcome = harness
        .run_with_id("run-c", Arc::new(MockProvider::new()))
        .await
        .expect("run");
    assert!(outcome.manifest.cancelled);
    assert!(outcome.manifest.trials.is_empty());
    assert!(outcome.dir.join(MANIFEST_FILE).exists());
}

#[tokio::test]
async fn interactive_trials_leave_a_gradable_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let harness = Harness::new(config(dir.path())).expect("config");
    let person = HumanPrompter::new(Cursor::new("Design error handling for a payment API.\nquit\n"), Vec::new());

    let outcome = harness
        .run_interactive(
            "human-a",
            "convergence/error_handling",
            Arc::new(MockProvider::new()),
            Box::new(person),
        )
        .await
        .expect("interactive run");
    assert_eq!(outcome.manifest.trials.len(), 1);
    assert_eq!(outcome.manifest.trials[0].seed, 0);
    assert_eq!(outcome.scorecard.entries.len(), 1);
    assert!(outcome.dir.join(&outcome.manifest.trials[0].trace).exists());

    let regrade = harness::regrade(dir.path(), "human-a").await.expect("regrade");
    assert_eq!(regrade.scorecard, outcome.scorecard);

    let unknown = harness
        .run_interactive(
            "human-b",
            "convergence/nope",
            Arc::new(MockProvider::new()),
            Box::new(HumanPrompter::new(Cursor::new(""), Vec::new())),
        )
        .await;
    assert!(matches!(unknown, Err(HarnessError::UnknownScenario(_))));
}

#[test]
fn invalid_configuration_is_rejected_up_front() {
    let config = HarnessConfig {
        seeds: 0,
        ..HarnessConfig::default()
    };
    assert!(Harness::new(config).is_err());
}
