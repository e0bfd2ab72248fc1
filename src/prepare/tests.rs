//! Unit tests for environment preparation.

use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};

use super::*;
use crate::provision::{ControlMode, ProvisionedEnvironment, ProvisionedNode};
use crate::suite::{HostSpec, RepoSpec, SuiteRecord};
use crate::test_support::{ScriptedExec, ScriptedTarget};
use crate::transport::Node;

struct Scratch {
    _tmp: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Scratch {
    fn log(&self) -> Utf8PathBuf {
        self.root.join("setup.log")
    }
}

#[fixture]
fn scratch() -> Scratch {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
    Scratch { _tmp: tmp, root }
}

fn suite(json: &str) -> Suite {
    SuiteRecord::from_json(json)
        .expect("parse suite")
        .validate()
        .expect("valid suite")
}

fn host_environment(target: &ScriptedTarget, ostree: bool) -> ProvisionedEnvironment {
    let spec = HostSpec {
        name: None,
        distro: String::from("fedora"),
        flavor: None,
        ostree: ostree.then(OstreeSpec::default),
    };
    let shared: Arc<dyn RemoteTarget> = Arc::new(target.clone());
    ProvisionedEnvironment {
        nodes: vec![ProvisionedNode {
            spec,
            node: Node {
                name: String::from("host"),
                address: String::from("192.0.2.1"),
                port: 22,
            },
            target: Arc::clone(&shared),
        }],
        container: None,
        execution_target: shared,
        mode: ControlMode::Single,
        exports: Vec::new(),
    }
}

#[rstest]
#[case(OstreeSpec::default(), vec!["rpm-ostree upgrade"])]
#[case(
    OstreeSpec { remote: Some(String::from("fedora")), branch: Some(String::from("fedora/x86_64/coreos")), revision: None },
    vec!["rpm-ostree rebase fedora:fedora/x86_64/coreos"]
)]
#[case(
    OstreeSpec { remote: None, branch: Some(String::from("stable")), revision: Some(String::from("abc123")) },
    vec!["rpm-ostree rebase stable", "rpm-ostree deploy abc123"]
)]
#[case(
    OstreeSpec { remote: None, branch: None, revision: Some(String::from("abc123")) },
    vec!["rpm-ostree deploy abc123"]
)]
fn ostree_commands_follow_the_requested_deployment(
    #[case] spec: OstreeSpec,
    #[case] expected: Vec<&str>,
) {
    assert_eq!(ostree_commands(&spec), expected);
}

#[rstest]
fn renders_repo_sections() {
    let repos = vec![
        RepoSpec {
            name: String::from("copr"),
            baseurl: String::from("https://example.org/copr"),
            gpgcheck: false,
        },
        RepoSpec {
            name: String::from("extras"),
            baseurl: String::from("https://example.org/extras"),
            gpgcheck: true,
        },
    ];
    assert_eq!(
        render_repo_file(&repos),
        "[copr]\nname=copr\nbaseurl=https://example.org/copr\ngpgcheck=0\n\n[extras]\nname=extras\nbaseurl=https://example.org/extras\ngpgcheck=1\n"
    );
}

#[rstest]
#[tokio::test]
async fn installs_repos_and_packages_with_cache_retries(scratch: Scratch) {
    let target = ScriptedTarget::new("host");
    for _ in 0..MAKECACHE_ATTEMPTS {
        target.push_exec(ScriptedExec::exit(1));
    }
    let environment = host_environment(&target, false);
    let suite = suite(
        r#"{"host": {"distro": "fedora"}, "packages": ["gcc", "make"],
            "extra-repos": [{"name": "copr", "baseurl": "https://example.org/copr"}]}"#,
    );
    let log = scratch.log();
    let preparer = Preparer::new(&environment, &suite, "/var/tmp/checkout", &log, &scratch.root);

    preparer.prepare(None).await.expect("prepare succeeds");

    let scripts = target.scripts();
    let makecache = scripts.iter().filter(|script| *script == "yum makecache").count();
    assert_eq!(makecache, MAKECACHE_ATTEMPTS);
    assert_eq!(scripts.last().map(String::as_str), Some("yum install -y gcc make"));
    let copies = target.copies_in();
    assert_eq!(
        copies.first().map(|(_, remote)| remote.as_str()),
        Some("/etc/yum.repos.d/tidewater-extra.repo")
    );
    let logged = std::fs::read_to_string(log.as_std_path()).expect("setup log");
    assert!(logged.contains("### [host] yum install -y gcc make"));
}

#[rstest]
#[tokio::test]
async fn failed_install_is_a_user_error(scratch: Scratch) {
    let target = ScriptedTarget::new("host");
    target.push_exec(ScriptedExec::exit(0));
    target.push_exec(ScriptedExec::exit(1));
    let environment = host_environment(&target, false);
    let suite = suite(r#"{"host": {"distro": "fedora"}, "packages": ["missing-pkg"]}"#);
    let log = scratch.log();
    let preparer = Preparer::new(&environment, &suite, "/src", &log, &scratch.root);

    let err = preparer.prepare(None).await.expect_err("install fails");
    assert!(matches!(err, PrepareError::User(message) if message == "failed to install packages"));
}

#[rstest]
#[tokio::test]
async fn ostree_on_plain_host_is_a_user_error(scratch: Scratch) {
    let target = ScriptedTarget::new("host");
    target.push_exec(ScriptedExec::exit(1));
    let environment = host_environment(&target, true);
    let suite = suite(r#"{"host": {"distro": "fedora", "ostree": {}}}"#);
    let log = scratch.log();
    let preparer = Preparer::new(&environment, &suite, "/src", &log, &scratch.root);

    let err = preparer.prepare(None).await.expect_err("not an OSTree host");
    assert!(matches!(err, PrepareError::User(message) if message.contains("non-OSTree")));
    assert_eq!(target.reboots(), 0);
}

#[rstest]
#[tokio::test]
async fn ostree_host_upgrades_layers_and_reboots(scratch: Scratch) {
    let target = ScriptedTarget::new("host");
    let environment = host_environment(&target, true);
    let suite = suite(r#"{"host": {"distro": "fedora", "ostree": {}}, "packages": ["vim"]}"#);
    let log = scratch.log();
    let preparer = Preparer::new(&environment, &suite, "/src", &log, &scratch.root);

    preparer.prepare(None).await.expect("prepare succeeds");

    assert_eq!(
        target.scripts(),
        vec!["test -e /run/ostree-booted", "rpm-ostree upgrade", "rpm-ostree install vim"]
    );
    assert_eq!(target.reboots(), 2);
}

#[rstest]
#[tokio::test]
async fn syncs_source_contents_into_workdir(scratch: Scratch) {
    let target = ScriptedTarget::new("host");
    let environment = host_environment(&target, false);
    let suite = suite(r#"{"host": {"distro": "fedora"}}"#);
    let log = scratch.log();
    let preparer = Preparer::new(&environment, &suite, "/var/tmp/checkout", &log, &scratch.root);

    preparer
        .prepare(Some(Utf8Path::new("/home/ci/project/")))
        .await
        .expect("prepare succeeds");

    assert_eq!(
        target.copies_in(),
        vec![(
            Utf8PathBuf::from("/home/ci/project/."),
            String::from("/var/tmp/checkout")
        )]
    );
}
