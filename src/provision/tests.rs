//! Unit tests for provisioning.

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};

use super::*;
use crate::suite::OstreeSpec;
use crate::test_support::{ScriptedBackend, ScriptedFactory, ScriptedRunner};

struct Harness {
    _tmp: tempfile::TempDir,
    settings: ProvisionSettings,
    backend: ScriptedBackend,
    runner: ScriptedRunner,
    factory: ScriptedFactory,
    registry: TeardownRegistry,
}

impl Harness {
    fn provisioner(&self) -> Provisioner<'_, ScriptedBackend, ScriptedRunner> {
        Provisioner::new(
            &self.backend,
            &self.runner,
            &self.factory,
            &self.registry,
            &self.settings,
        )
    }
}

#[fixture]
fn harness() -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
    let template = InstanceTemplate {
        instance_type: String::from("DEV1-M"),
        zone: String::from("fr-par-1"),
        project_id: String::from("project"),
        organisation_id: None,
        architecture: String::from("x86_64"),
        name_prefix: String::from("tidewater"),
        user_data: None,
        floating_ip: false,
    };
    Harness {
        settings: ProvisionSettings {
            run_id: String::from("run1"),
            template,
            container_bin: String::from("docker"),
            reuse_node: None,
            key_cache_dir: root.join("keys"),
            staging_dir: root.join("staging"),
        },
        _tmp: tmp,
        backend: ScriptedBackend::new(),
        runner: ScriptedRunner::new(),
        factory: ScriptedFactory::new(),
        registry: TeardownRegistry::new(),
    }
}

fn host(name: &str) -> HostSpec {
    HostSpec {
        name: Some(name.to_owned()),
        distro: String::from("fedora-40"),
        flavor: None,
        ostree: None,
    }
}

#[rstest]
#[case("node1", "NODE1_IP")]
#[case("db-primary", "DB_PRIMARY_IP")]
#[case("web.2", "WEB_2_IP")]
#[case("1st", "_1ST_IP")]
fn sanitises_export_names(#[case] name: &str, #[case] expected: &str) {
    assert_eq!(export_name(name), expected);
}

#[rstest]
#[tokio::test]
async fn single_host_is_registered_and_reachable(harness: Harness) {
    let topology = Topology::Host(HostSpec {
        name: None,
        ..host("ignored")
    });

    let environment = harness
        .provisioner()
        .provision(&topology)
        .await
        .expect("provision");

    assert_eq!(environment.mode, ControlMode::Single);
    assert_eq!(environment.execution_target.name(), DEFAULT_HOST_NAME);
    assert_eq!(
        environment.nodes.first().map(|node| node.node.address.as_str()),
        Some("192.0.2.1")
    );
    let registered = harness.registry.snapshot();
    assert_eq!(registered.len(), 1);
    assert_eq!(
        registered.first().map(Resource::label),
        Some("tidewater-run1-host")
    );
}

#[rstest]
#[tokio::test]
async fn reused_node_skips_the_backend(mut harness: Harness) {
    harness.settings.reuse_node = Some(ReusedNode {
        name: String::from("debug"),
        address: String::from("203.0.113.9"),
    });
    let environment = harness
        .provisioner()
        .provision(&Topology::Host(host("ignored")))
        .await
        .expect("provision");

    assert_eq!(environment.execution_target.name(), "debug");
    assert!(harness.backend.created().is_empty());
    assert!(harness.registry.is_empty());
}

#[rstest]
#[tokio::test]
async fn user_attributable_backend_failure_is_a_user_error(harness: Harness) {
    harness.backend.fail_create("host", true);
    let err = harness
        .provisioner()
        .provision(&Topology::Host(HostSpec {
            name: None,
            ..host("ignored")
        }))
        .await
        .expect_err("provisioning fails");
    assert!(matches!(err, ProvisionError::User(message) if message.contains("host")));
    assert!(harness.registry.is_empty());
}

#[rstest]
#[tokio::test]
async fn container_pull_failure_is_a_user_error(harness: Harness) {
    harness.runner.push_failure(1);
    let err = harness
        .provisioner()
        .provision(&Topology::Container(ContainerSpec {
            image: String::from("registry.example.org/missing:latest"),
        }))
        .await
        .expect_err("pull fails");
    assert!(matches!(err, ProvisionError::User(message) if message.contains("failed to pull image")));
    assert!(harness.registry.is_empty());
}

#[rstest]
#[tokio::test]
async fn container_is_started_labelled_and_registered(harness: Harness) {
    harness.runner.push_success();
    harness.runner.push_stdout("abc123\n");
    let environment = harness
        .provisioner()
        .provision(&Topology::Container(ContainerSpec {
            image: String::from("fedora:40"),
        }))
        .await
        .expect("container starts");

    assert_eq!(environment.execution_target.name(), CONTAINER_NAME);
    assert_eq!(
        harness.runner.command_strings(),
        vec![
            "docker pull fedora:40",
            "docker run --detach --label tidewater.run=run1 --entrypoint sleep fedora:40 infinity",
        ]
    );
    assert_eq!(
        harness.registry.snapshot(),
        vec![Resource::Container {
            name: String::from(CONTAINER_NAME),
            id: String::from("abc123"),
        }]
    );
}

#[rstest]
#[tokio::test]
async fn cluster_exports_addresses_in_host_order(harness: Harness) {
    let topology = Topology::Cluster(ClusterSpec {
        hosts: vec![host("node1"), host("node-2")],
        container: None,
    });
    let environment = harness
        .provisioner()
        .provision(&topology)
        .await
        .expect("cluster");

    assert_eq!(environment.mode, ControlMode::ClusterHost);
    assert_eq!(environment.execution_target.name(), "node1");
    assert_eq!(
        environment.exports,
        vec![
            (String::from("NODE1_IP"), String::from("192.0.2.1")),
            (String::from("NODE_2_IP"), String::from("192.0.2.2")),
        ]
    );
    assert_eq!(environment.artifact_sources().len(), 2);
}

#[rstest]
#[tokio::test]
async fn cluster_fails_as_a_whole_when_one_host_fails(harness: Harness) {
    harness.backend.fail_create("node2", false);
    let topology = Topology::Cluster(ClusterSpec {
        hosts: vec![host("node1"), host("node2"), host("node3")],
        container: None,
    });
    let err = harness
        .provisioner()
        .provision(&topology)
        .await
        .expect_err("cluster fails");

    assert!(matches!(err, ProvisionError::Backend(_)));
    let labels: Vec<String> = harness
        .registry
        .snapshot()
        .iter()
        .map(|resource| resource.label().to_owned())
        .collect();
    assert_eq!(labels, vec!["tidewater-run1-node1", "tidewater-run1-node3"]);
}

#[rstest]
#[tokio::test]
async fn container_controlled_cluster_bootstraps_trust(harness: Harness) {
    let keys = &harness.settings.key_cache_dir;
    crate::util::write_ambient(&keys.join("id_ed25519"), b"private").expect("key");
    crate::util::write_ambient(&keys.join("id_ed25519.pub"), b"public").expect("pub key");
    harness.runner.push_success();
    harness.runner.push_stdout("ctrl\n");
    let topology = Topology::Cluster(ClusterSpec {
        hosts: vec![
            host("node1"),
            HostSpec {
                ostree: Some(OstreeSpec::default()),
                ..host("node2")
            },
        ],
        container: Some(ContainerSpec {
            image: String::from("fedora:40"),
        }),
    });

    let environment = harness
        .provisioner()
        .provision(&topology)
        .await
        .expect("cluster");

    assert_eq!(environment.mode, ControlMode::ClusterContainer);
    assert_eq!(environment.execution_target.name(), CONTAINER_NAME);
    assert_eq!(environment.package_targets().len(), 1);

    let controller = harness.factory.target(CONTAINER_NAME);
    let scripts = controller.scripts().join("\n");
    assert!(scripts.contains("cat /tmp/tidewater-cluster-hosts >> /etc/hosts"));
    assert!(scripts.contains("ssh-keyscan -p 22 192.0.2.1 node1"));
    assert!(scripts.contains("ssh-keyscan -p 22 192.0.2.2 node2"));
    let node = harness.factory.target("node2");
    assert!(
        node.copies_in()
            .iter()
            .any(|(_, remote)| remote == "/root/.ssh/id_ed25519.pub")
    );
    assert_eq!(harness.registry.snapshot().len(), 3);
}

#[rstest]
#[tokio::test]
async fn keypair_is_generated_once(harness: Harness) {
    harness.runner.push_success();
    let keypair = ensure_keypair(&harness.runner, &harness.settings.key_cache_dir)
        .await
        .expect("generate");
    assert_eq!(keypair.private_key, harness.settings.key_cache_dir.join("id_ed25519"));
    let commands = harness.runner.command_strings();
    assert_eq!(commands.len(), 1);
    assert!(commands.first().is_some_and(|command| command.starts_with("ssh-keygen -t ed25519")));
}
