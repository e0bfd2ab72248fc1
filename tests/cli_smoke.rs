//! Behavioural smoke tests for the command-line entrypoints.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use rstest::rstest;

#[rstest]
fn bare_invocation_prints_usage() {
    let mut cmd = cargo_bin_cmd!("tidewater");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[rstest]
fn help_lists_the_run_command() {
    let mut cmd = cargo_bin_cmd!("tidewater");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"));
}

#[rstest]
fn run_requires_a_commit() {
    let mut cmd = cargo_bin_cmd!("tidewater");
    cmd.args(["run", "--suite", "suite.json"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--commit"));
}

#[rstest]
fn missing_suite_file_exits_with_an_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let suite = tmp.path().join("absent.json");
    let mut cmd = cargo_bin_cmd!("tidewater");
    cmd.arg("run")
        .arg("--suite")
        .arg(&suite)
        .args(["--commit", "abc123"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid suite"));
}

fn run_in(tmp: &tempfile::TempDir, json: &str) -> assert_cmd::Command {
    let suite = tmp.path().join("suite.json");
    std::fs::write(&suite, json).expect("write suite");
    let mut cmd = cargo_bin_cmd!("tidewater");
    cmd.current_dir(tmp.path())
        .env("HOME", tmp.path())
        .env("RUST_LOG", "info")
        .env("TIDEWATER_STATE_DIR", tmp.path().join("state"))
        .env_remove("TIDEWATER_NOTIFY_GITHUB_TOKEN")
        .env_remove("SCW_SECRET_KEY")
        .env_remove("SCW_DEFAULT_PROJECT_ID")
        .arg("run")
        .arg("--suite")
        .arg(&suite)
        .args(["--commit", "abc123", "--log-json"]);
    cmd
}

#[rstest]
fn unparseable_suite_exits_with_an_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    run_in(&tmp, "{not json")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid suite"));
}

#[rstest]
#[case(r#"{"tests": ["true"]}"#, "default")]
#[case(r#"{"context": "bad;context", "container": {"image": "fedora"}}"#, "default")]
#[case(
    r#"{"context": "fedora", "container": {"image": "fedora"}, "tests": ["true"], "timeout": "3h"}"#,
    "fedora"
)]
fn invalid_suites_are_reported_as_failures(#[case] json: &str, #[case] context: &str) {
    let tmp = tempfile::tempdir().expect("tempdir");
    run_in(&tmp, json)
        .assert()
        .code(0)
        .stdout(predicate::str::starts_with("suite error:"))
        .stderr(predicate::str::contains(r#""state":"failure""#))
        .stderr(predicate::str::contains(format!(r#""context":"{context}""#)))
        .stderr(predicate::str::contains("Invalid test suite"));
}

#[rstest]
fn container_suites_run_without_cloud_credentials() {
    let tmp = tempfile::tempdir().expect("tempdir");
    run_in(&tmp, r#"{"container": {"image": "fedora"}, "build": false, "tests": ["true"]}"#)
        .env("TIDEWATER_TRANSPORT_CONTAINER_BIN", "false")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("suite error: failed to pull image fedora"))
        .stderr(predicate::str::contains("secret").not());
}

#[rstest]
fn janitor_requires_a_run_id() {
    let mut cmd = cargo_bin_cmd!("tidewater-janitor");
    cmd.env_remove("TIDEWATER_RUN_ID")
        .env_remove("SCW_DEFAULT_PROJECT_ID")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--project-id"));
}
