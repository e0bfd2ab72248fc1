//! Unit tests for teardown.

use rstest::rstest;

use super::*;
use crate::test_support::{ScriptedBackend, ScriptedRunner};

fn instance(name: &str) -> Resource {
    Resource::Instance(InstanceHandle {
        id: format!("srv-{name}"),
        name: name.to_owned(),
        zone: String::from("fr-par-1"),
        floating_ip: None,
    })
}

fn container(id: &str) -> Resource {
    Resource::Container {
        name: String::from("container"),
        id: id.to_owned(),
    }
}

#[rstest]
#[tokio::test]
async fn releases_hosts_before_containers_once() {
    let backend = ScriptedBackend::new();
    let runner = ScriptedRunner::permissive();
    let registry = TeardownRegistry::new();
    registry.register(container("c-1"));
    registry.register(instance("run-node1"));
    registry.register(instance("run-node2"));

    let manager = TeardownManager::new(&backend, &runner, "docker", false);
    let summary = manager.teardown(&registry).await.expect("teardown");

    assert_eq!(summary.released, vec!["run-node1", "run-node2", "container"]);
    assert_eq!(backend.destroyed(), vec!["run-node1", "run-node2"]);
    assert_eq!(runner.command_strings(), vec!["docker rm -f c-1"]);
    assert!(registry.is_empty());

    let again = manager.teardown(&registry).await.expect("second teardown");
    assert!(again.released.is_empty());
    assert_eq!(backend.destroyed().len(), 2);
}

#[rstest]
#[tokio::test]
async fn keeps_going_after_a_failure() {
    let backend = ScriptedBackend::new();
    backend.fail_destroy("run-node1");
    let runner = ScriptedRunner::permissive();
    let registry = TeardownRegistry::new();
    registry.register(instance("run-node1"));
    registry.register(instance("run-node2"));

    let manager = TeardownManager::new(&backend, &runner, "docker", false);
    let err = manager.teardown(&registry).await.expect_err("one release fails");

    assert_eq!(err.failures.len(), 1);
    assert!(err.failures.first().is_some_and(|failure| failure.starts_with("run-node1")));
    assert_eq!(backend.destroyed(), vec!["run-node1", "run-node2"]);
}

#[rstest]
#[tokio::test]
async fn suppressed_teardown_keeps_resources() {
    let backend = ScriptedBackend::new();
    let runner = ScriptedRunner::new();
    let registry = TeardownRegistry::new();
    registry.register(instance("run-node1"));
    registry.register(container("c-1"));

    let manager = TeardownManager::new(&backend, &runner, "docker", true);
    let summary = manager.teardown(&registry).await.expect("teardown");

    assert_eq!(summary.kept, vec!["run-node1", "container"]);
    assert!(backend.destroyed().is_empty());
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn unrecorded_handles_are_skipped() {
    let backend = ScriptedBackend::new();
    let runner = ScriptedRunner::new();
    let registry = TeardownRegistry::new();
    registry.register(container(""));
    registry.register(Resource::Instance(InstanceHandle {
        id: String::new(),
        name: String::from("run-node1"),
        zone: String::from("fr-par-1"),
        floating_ip: None,
    }));

    let manager = TeardownManager::new(&backend, &runner, "docker", false);
    let summary = manager.teardown(&registry).await.expect("teardown");

    assert_eq!(summary.released.len(), 2);
    assert!(backend.destroyed().is_empty());
    assert!(runner.invocations().is_empty());
}

#[rstest]
fn snapshot_does_not_drain() {
    let registry = TeardownRegistry::new();
    registry.register(container("c-1"));
    assert_eq!(registry.snapshot().len(), 1);
    assert!(!registry.is_empty());
}
