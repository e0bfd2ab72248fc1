//! Unit tests for the run orchestrator.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};

use super::*;
use crate::backend::InstanceTemplate;
use crate::status::StatusState;
use crate::suite::SuiteRecord;
use crate::test_support::{
    RecordingNotifier, ScriptedBackend, ScriptedExec, ScriptedFactory, ScriptedRunner,
};

struct Harness {
    _tmp: tempfile::TempDir,
    settings: RunSettings,
    backend: ScriptedBackend,
    runner: ScriptedRunner,
    factory: ScriptedFactory,
    notifier: RecordingNotifier,
}

impl Harness {
    fn orchestrator(&self) -> RunOrchestrator<'_, ScriptedBackend, ScriptedRunner> {
        RunOrchestrator::new(
            &self.backend,
            &self.runner,
            &self.factory,
            &self.notifier,
            &self.settings,
        )
    }

    fn states(&self) -> Vec<StatusState> {
        self.notifier.reports().iter().map(|report| report.state).collect()
    }

    fn descriptions(&self) -> Vec<String> {
        self.notifier
            .reports()
            .into_iter()
            .map(|report| report.description)
            .collect()
    }
}

#[fixture]
fn harness() -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
    Harness {
        settings: RunSettings {
            state_dir: root.join("state"),
            key_cache_dir: root.join("keys"),
            template: InstanceTemplate {
                instance_type: String::from("DEV1-M"),
                zone: String::from("fr-par-1"),
                project_id: String::from("project"),
                organisation_id: None,
                architecture: String::from("x86_64"),
                name_prefix: String::from("tidewater"),
                user_data: None,
                floating_ip: false,
            },
            container_bin: String::from("docker"),
            reuse_node: None,
            workdir: String::from("/var/tmp/checkout"),
            publish: crate::publish::PublishSettings::default(),
            no_teardown: false,
        },
        _tmp: tmp,
        backend: ScriptedBackend::new(),
        runner: ScriptedRunner::permissive(),
        factory: ScriptedFactory::new(),
        notifier: RecordingNotifier::new(),
    }
}

fn request(json: &str) -> RunRequest {
    RunRequest {
        run_id: String::from("run1"),
        suite: SuiteRecord::from_json(json)
            .expect("parse suite")
            .validate()
            .expect("valid suite"),
        commit: String::from("abc123"),
        branch: None,
        source: None,
        merge_verified: true,
    }
}

const CONTAINER_SUITE: &str =
    r#"{"context": "fedora", "container": {"image": "fedora:40"}, "build": false, "tests": ["make check"]}"#;

fn start_container(harness: &Harness) {
    harness.runner.push_success();
    harness.runner.push_stdout("cid\n");
}

#[rstest]
#[tokio::test]
async fn passing_container_run_reports_success_and_cleans_up(harness: Harness) {
    start_container(&harness);

    let report = harness
        .orchestrator()
        .execute_until(request(CONTAINER_SUITE), std::future::pending())
        .await
        .expect("run completes");

    assert_eq!(report.verdict, RunVerdict::Completed(crate::phase::PhaseOutcome::Success));
    assert_eq!(
        harness.states(),
        vec![StatusState::Pending, StatusState::Pending, StatusState::Success]
    );
    assert_eq!(report.teardown.released, vec!["container"]);
    assert_eq!(
        harness.runner.command_strings().last().map(String::as_str),
        Some("docker rm -f cid")
    );
    let publication = report.publication.expect("published locally");
    assert_eq!(publication.reference, Utf8PathBuf::from("output.log"));
}

#[rstest]
#[tokio::test]
async fn failed_build_skips_tests(harness: Harness) {
    start_container(&harness);
    harness
        .factory
        .target("container")
        .push_exec(ScriptedExec::exit(2));
    let suite = r#"{"container": {"image": "fedora:40"}, "tests": ["make check"]}"#;

    let report = harness
        .orchestrator()
        .execute_until(request(suite), std::future::pending())
        .await
        .expect("run completes");

    assert_eq!(report.verdict, RunVerdict::Completed(crate::phase::PhaseOutcome::Failed(2)));
    let descriptions = harness.descriptions();
    assert!(!descriptions.iter().any(|text| text == "Running tests"));
    assert_eq!(
        descriptions.last().map(String::as_str),
        Some("Tests failed with exit code 2")
    );
    assert_eq!(harness.factory.target("container").execs().len(), 1);
}

#[rstest]
#[tokio::test]
async fn user_error_ends_cleanly_with_a_failure_status(harness: Harness) {
    harness.backend.fail_create("host", true);
    let suite = r#"{"host": {"distro": "nonexistent"}, "tests": ["true"]}"#;

    let report = harness
        .orchestrator()
        .execute_until(request(suite), std::future::pending())
        .await
        .expect("user errors are outcomes");

    assert!(matches!(report.verdict, RunVerdict::UserError(ref message) if message.contains("host")));
    assert_eq!(harness.states().last(), Some(&StatusState::Failure));
}

#[rstest]
#[tokio::test]
async fn cluster_with_failed_host_tears_down_the_rest(harness: Harness) {
    harness.backend.fail_create("node2", false);
    let suite = r#"{"cluster": {"hosts": [
        {"name": "node1", "distro": "fedora"},
        {"name": "node2", "distro": "fedora"},
        {"name": "node3", "distro": "fedora"}]}, "tests": ["true"]}"#;

    let err = harness
        .orchestrator()
        .execute_until(request(suite), std::future::pending())
        .await
        .expect_err("infrastructure failure");

    assert!(matches!(err, RunError::Provision(_)));
    assert_eq!(
        harness.backend.destroyed(),
        vec!["tidewater-run1-node1", "tidewater-run1-node3"]
    );
    let terminal: Vec<StatusState> = harness
        .states()
        .into_iter()
        .filter(|state| state.is_terminal())
        .collect();
    assert_eq!(terminal, vec![StatusState::Error]);
    for node in ["node1", "node3"] {
        assert!(harness.factory.target(node).execs().is_empty());
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn interrupt_reports_error_and_tears_down(harness: Harness) {
    start_container(&harness);
    harness
        .factory
        .target("container")
        .push_exec(ScriptedExec::exit(0).lasting(Duration::from_secs(3600)));
    let shutdown = async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        String::from("SIGTERM")
    };

    let err = harness
        .orchestrator()
        .execute_until(request(CONTAINER_SUITE), shutdown)
        .await
        .expect_err("interrupted");

    assert!(matches!(err, RunError::Interrupted(ref name) if name == "SIGTERM"));
    assert_eq!(harness.states().last(), Some(&StatusState::Error));
    assert_eq!(
        harness.runner.command_strings().last().map(String::as_str),
        Some("docker rm -f cid")
    );
}

#[rstest]
#[tokio::test]
async fn unselected_branch_is_skipped_without_side_effects(harness: Harness) {
    let mut skipped = request(CONTAINER_SUITE);
    skipped.branch = Some(String::from("feature"));

    let report = harness
        .orchestrator()
        .execute_until(skipped, std::future::pending())
        .await
        .expect("skip");

    assert!(matches!(report.verdict, RunVerdict::Skipped(_)));
    assert!(harness.notifier.reports().is_empty());
    assert!(harness.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn no_teardown_keeps_resources(mut harness: Harness) {
    harness.settings.no_teardown = true;
    start_container(&harness);

    let report = harness
        .orchestrator()
        .execute_until(request(CONTAINER_SUITE), std::future::pending())
        .await
        .expect("run completes");

    assert_eq!(report.teardown.kept, vec!["container"]);
    assert!(
        !harness
            .runner
            .command_strings()
            .iter()
            .any(|command| command.contains("rm -f"))
    );
}

#[rstest]
#[tokio::test]
async fn panicking_stage_reports_error_and_tears_down_once(harness: Harness) {
    start_container(&harness);
    harness
        .factory
        .target("container")
        .push_exec(ScriptedExec::panicking());

    let err = harness
        .orchestrator()
        .execute_until(request(CONTAINER_SUITE), std::future::pending())
        .await
        .expect_err("panic is an internal error");

    assert!(matches!(err, RunError::Panicked(ref message) if message.contains("make check")));
    let terminal: Vec<(StatusState, String)> = harness
        .notifier
        .reports()
        .into_iter()
        .filter(|report| report.state.is_terminal())
        .map(|report| (report.state, report.description))
        .collect();
    assert_eq!(
        terminal,
        vec![(StatusState::Error, String::from(INTERNAL_ERROR_DESCRIPTION))]
    );
    let removals = harness
        .runner
        .command_strings()
        .into_iter()
        .filter(|command| command == "docker rm -f cid")
        .count();
    assert_eq!(removals, 1);
}

#[rstest]
#[tokio::test]
async fn unusable_state_dir_still_reports_an_error(mut harness: Harness) {
    let blocker = harness.settings.state_dir.clone();
    std::fs::write(blocker.as_std_path(), "not a directory").expect("write blocker");
    harness.settings.state_dir = blocker.join("nested");

    let err = harness
        .orchestrator()
        .execute_until(request(CONTAINER_SUITE), std::future::pending())
        .await
        .expect_err("state dir cannot be created");

    assert!(matches!(err, RunError::Bundle(_)));
    assert_eq!(harness.states(), vec![StatusState::Error]);
    assert_eq!(
        harness.descriptions(),
        vec![String::from(INTERNAL_ERROR_DESCRIPTION)]
    );
    assert!(harness.runner.invocations().is_empty());
}
