//! Artifact collection.
//!
//! Declared paths are fetched from each source target into the bundle's
//! `artifacts/` directory. Directories left empty by failed copies are
//! pruned afterwards, so a run without artifacts leaves no trace of it.

use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::bundle::UploadBundle;
use crate::transport::RemoteTarget;

/// Resolves an artifact path against the remote checkout.
#[must_use]
pub fn remote_artifact_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path.trim_start_matches("./"))
    }
}

/// Copies declared artifacts into `bundle` and returns how many were found.
///
/// With `per_host` set, each source gets its own `artifacts/<name>/`
/// subdirectory. Missing paths and failed copies are logged and skipped.
pub async fn collect_artifacts(
    sources: &[Arc<dyn RemoteTarget>],
    per_host: bool,
    paths: &[String],
    workdir: &str,
    bundle: &UploadBundle,
) -> usize {
    let mut collected = 0;
    for source in sources {
        let dest: Utf8PathBuf = if per_host {
            bundle.artifacts_dir().join(source.name())
        } else {
            bundle.artifacts_dir()
        };
        for path in paths {
            let remote = remote_artifact_path(workdir, path);
            match source.exists(&remote).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(node = source.name(), path = %remote, "artifact not found");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(node = source.name(), path = %remote, error = %err, "artifact check failed");
                    continue;
                }
            }
            match source.copy_out(&remote, &dest).await {
                Ok(()) => {
                    tracing::info!(node = source.name(), path = %remote, "artifact collected");
                    collected += 1;
                }
                Err(err) => {
                    tracing::warn!(node = source.name(), path = %remote, error = %err, "artifact copy failed");
                }
            }
        }
    }
    if let Err(err) = bundle.prune_artifacts() {
        tracing::warn!(error = %err, "cannot prune empty artifact directories");
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedRunner, ScriptedTarget};
    use crate::transport::{ContainerTarget, ScriptStager, TransportConfig};
    use rstest::rstest;

    fn bundle() -> (tempfile::TempDir, UploadBundle) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("bundle")).expect("utf8 path");
        let created = UploadBundle::create(&root).expect("bundle");
        (tmp, created)
    }

    #[rstest]
    #[case("/var/tmp/checkout", "logs/test.log", "/var/tmp/checkout/logs/test.log")]
    #[case("/var/tmp/checkout/", "./out.xml", "/var/tmp/checkout/out.xml")]
    #[case("/src", "/var/log/messages", "/var/log/messages")]
    fn resolves_paths_against_workdir(#[case] workdir: &str, #[case] path: &str, #[case] expected: &str) {
        assert_eq!(remote_artifact_path(workdir, path), expected);
    }

    #[rstest]
    #[tokio::test]
    async fn nothing_found_leaves_no_artifacts_dir() {
        let (_tmp, bundle) = bundle();
        let target: Arc<dyn RemoteTarget> = Arc::new(ScriptedTarget::new("host"));
        let paths = vec![String::from("missing.log")];

        let collected = collect_artifacts(&[target], false, &paths, "/src", &bundle).await;

        assert_eq!(collected, 0);
        assert!(!bundle.artifacts_dir().exists());
        assert!(bundle.files().expect("list").is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn failed_copy_leaves_no_artifacts_dir() {
        let (tmp, bundle) = bundle();
        let staging = Utf8PathBuf::from_path_buf(tmp.path().join("staging")).expect("utf8 path");
        let runner = ScriptedRunner::new();
        // exists: stage the test script, then run it; copy_out: docker cp fails.
        runner.push_success();
        runner.push_success();
        runner.push_failure(1);
        let target: Arc<dyn RemoteTarget> = Arc::new(ContainerTarget::new(
            Arc::new(runner.clone()),
            Arc::new(TransportConfig::default()),
            "container",
            "cid",
            ScriptStager::new(staging, String::from("/tmp")),
        ));
        let paths = vec![String::from("out.xml")];

        let collected = collect_artifacts(&[target], false, &paths, "/src", &bundle).await;

        assert_eq!(collected, 0);
        assert!(runner
            .command_strings()
            .last()
            .is_some_and(|command| command.starts_with("docker cp cid:/src/out.xml ")));
        assert!(!bundle.artifacts_dir().exists());
    }

    #[rstest]
    #[tokio::test]
    async fn empty_host_directories_are_pruned() {
        let (_tmp, bundle) = bundle();
        let first = ScriptedTarget::new("node1");
        let second = ScriptedTarget::new("node2");
        first.add_path("/src/results.xml");
        let sources: Vec<Arc<dyn RemoteTarget>> = vec![Arc::new(first), Arc::new(second)];
        std::fs::create_dir_all(bundle.artifacts_dir().join("node2").as_std_path())
            .expect("seed empty dir");
        let paths = vec![String::from("results.xml")];

        let collected = collect_artifacts(&sources, true, &paths, "/src", &bundle).await;

        assert_eq!(collected, 1);
        assert!(bundle.artifacts_dir().join("node1").is_dir());
        assert!(!bundle.artifacts_dir().join("node2").exists());
    }

    #[rstest]
    #[tokio::test]
    async fn host_controlled_cluster_collects_per_host() {
        let (_tmp, bundle) = bundle();
        let first = ScriptedTarget::new("node1");
        let second = ScriptedTarget::new("node2");
        first.add_path("/src/results.xml");
        second.add_path("/src/results.xml");
        let sources: Vec<Arc<dyn RemoteTarget>> = vec![Arc::new(first), Arc::new(second)];
        let paths = vec![String::from("results.xml"), String::from("absent.txt")];

        let collected = collect_artifacts(&sources, true, &paths, "/src", &bundle).await;

        assert_eq!(collected, 2);
        assert_eq!(
            bundle.files().expect("list"),
            vec![
                Utf8PathBuf::from("artifacts/node1/results.xml"),
                Utf8PathBuf::from("artifacts/node2/results.xml"),
            ]
        );
    }
}
