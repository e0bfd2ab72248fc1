//! Unit tests for the janitor module.

use super::*;
use crate::test_support::{ScriptedRunner, json_tagged};
use rstest::rstest;

const OURS: &[&str] = &["tidewater", "tidewater-run-run-1"];
const THEIRS: &[&str] = &["tidewater", "tidewater-run-run-2"];

fn config() -> JanitorConfig {
    JanitorConfig::new("project", "run-1", DEFAULT_SCW_BIN, DEFAULT_CONTAINER_BIN).expect("config")
}

#[rstest]
fn config_builds_tag_and_label_filter() {
    let cfg = config();
    assert_eq!(cfg.run_tag(), "tidewater-run-run-1");
    assert_eq!(cfg.container_filter(), "label=tidewater.run=run-1");
}

#[rstest]
#[case("project_id", " ", "run-1", DEFAULT_SCW_BIN, DEFAULT_CONTAINER_BIN)]
#[case("run_id", "proj", " ", DEFAULT_SCW_BIN, DEFAULT_CONTAINER_BIN)]
#[case("scw_bin", "proj", "run-1", "  ", DEFAULT_CONTAINER_BIN)]
#[case("container_bin", "proj", "run-1", DEFAULT_SCW_BIN, "")]
fn config_rejects_blank_fields(
    #[case] expected_field: &str,
    #[case] project_id: &str,
    #[case] run_id: &str,
    #[case] scw_bin: &str,
    #[case] container_bin: &str,
) {
    let err = JanitorConfig::new(project_id, run_id, scw_bin, container_bin)
        .expect_err("expected invalid config");
    assert_eq!(
        err,
        JanitorError::InvalidConfig {
            field: expected_field.to_owned()
        }
    );
}

#[rstest]
#[tokio::test]
async fn sweep_deletes_only_marked_resources() {
    let runner = ScriptedRunner::new();
    // servers
    runner.push_stdout(json_tagged(&[
        ("srv-a", "fr-par-1", OURS),
        ("srv-b", "fr-par-1", THEIRS),
    ]));
    runner.push_success();
    // ips
    runner.push_stdout(json_tagged(&[("ip-a", "fr-par-1", OURS)]));
    runner.push_success();
    // containers
    runner.push_stdout("c1\nc2\n");
    runner.push_success();
    // verification
    runner.push_stdout(json_tagged(&[("srv-b", "fr-par-1", THEIRS)]));
    runner.push_stdout("[]");
    runner.push_stdout("");

    let janitor = Janitor::new(config(), runner.clone());
    let summary = janitor.sweep().await.expect("sweep should succeed");

    assert_eq!(
        summary,
        SweepSummary {
            deleted_servers: 1,
            deleted_ips: 1,
            deleted_containers: 2,
        }
    );
    let commands = runner.command_strings();
    assert!(commands.contains(&String::from(
        "scw instance server delete srv-a zone=fr-par-1 with-ip=true force-shutdown=true"
    )));
    assert!(commands.contains(&String::from("scw instance ip delete ip-a zone=fr-par-1")));
    assert!(commands.contains(&String::from("docker rm -f c1 c2")));
}

#[rstest]
#[tokio::test]
async fn sweep_reports_leftovers() {
    let runner = ScriptedRunner::new();
    let leftover = json_tagged(&[("srv-a", "fr-par-1", OURS)]);
    runner.push_stdout("[]");
    runner.push_stdout("[]");
    runner.push_stdout("");
    runner.push_stdout(leftover);
    runner.push_stdout("[]");
    runner.push_stdout("");

    let janitor = Janitor::new(config(), runner);
    let err = janitor.sweep().await.expect_err("leftover server");
    assert!(matches!(err, JanitorError::NotClean { .. }));
}

#[rstest]
#[tokio::test]
async fn unparseable_listing_is_reported() {
    let runner = ScriptedRunner::new();
    runner.push_stdout("not json");
    let janitor = Janitor::new(config(), runner);
    let err = janitor.sweep().await.expect_err("parse failure");
    assert!(matches!(err, JanitorError::Parse { ref resource, .. } if resource == "servers"));
}
