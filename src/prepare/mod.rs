//! Environment preparation.
//!
//! Runs after provisioning and before building: syncs the source tree,
//! performs OSTree deployments, installs extra repositories and packages.
//! Every command gets its own hard timeout rather than drawing on the
//! build and test budget, and all output lands in `setup.log`.

mod repos;

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::phase::{PhaseError, append_log};
use crate::provision::{PackageTarget, ProvisionedEnvironment};
use crate::suite::{OstreeSpec, Suite};
use crate::transport::{CommandOutput, ExecOptions, RemoteTarget, TransportError};
use crate::util::write_ambient;

pub use repos::{REPO_FILE_NAME, render_repo_file};

/// Hard timeout for each preparation command.
pub const SETUP_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Attempts made to refresh the package cache.
pub const MAKECACHE_ATTEMPTS: usize = 5;

const REPO_DIR: &str = "/etc/yum.repos.d";

/// Errors raised while preparing the environment.
#[derive(Debug, Error)]
pub enum PrepareError {
    /// Attributable to the suite; reported and the run ends cleanly.
    #[error("{0}")]
    User(String),
    /// Failure talking to a target.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Failure writing the setup log.
    #[error(transparent)]
    Log(#[from] PhaseError),
    /// Failure staging a local file.
    #[error("failed to stage {0}")]
    Stage(String),
}

/// Prepares a provisioned environment for building.
pub struct Preparer<'a> {
    environment: &'a ProvisionedEnvironment,
    suite: &'a Suite,
    workdir: &'a str,
    log: &'a Utf8Path,
    staging_dir: &'a Utf8Path,
}

impl std::fmt::Debug for Preparer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preparer")
            .field("context", &self.suite.context)
            .field("workdir", &self.workdir)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

impl<'a> Preparer<'a> {
    /// Creates a preparer logging into `log` and staging files under
    /// `staging_dir`.
    #[must_use]
    pub const fn new(
        environment: &'a ProvisionedEnvironment,
        suite: &'a Suite,
        workdir: &'a str,
        log: &'a Utf8Path,
        staging_dir: &'a Utf8Path,
    ) -> Self {
        Self {
            environment,
            suite,
            workdir,
            log,
            staging_dir,
        }
    }

    /// Runs every preparation step in order.
    ///
    /// # Errors
    ///
    /// Returns [`PrepareError::User`] for failures caused by the suite and
    /// other variants for infrastructure failures.
    pub async fn prepare(&self, source: Option<&Utf8Path>) -> Result<(), PrepareError> {
        if let Some(dir) = source {
            self.sync_source(dir).await?;
        }
        for node in &self.environment.nodes {
            if let Some(ostree) = &node.spec.ostree {
                self.deploy_ostree(node.target.as_ref(), ostree).await?;
            }
        }

        let targets = self.environment.package_targets();
        if !self.suite.extra_repos.is_empty() {
            self.install_repos(&targets).await?;
        }
        if !self.suite.packages.is_empty() {
            for package_target in &targets {
                self.refresh_cache(package_target).await?;
                self.install_packages(package_target).await?;
            }
        }
        Ok(())
    }

    async fn step(&self, target: &dyn RemoteTarget, script: &str) -> Result<CommandOutput, PrepareError> {
        append_log(self.log, &format!("### [{}] {script}\n", target.name())).await?;
        let output = target
            .exec(
                script,
                ExecOptions::with_timeout(SETUP_COMMAND_TIMEOUT).logged(self.log),
            )
            .await?;
        if !output.is_success() {
            append_log(
                self.log,
                &format!("### EXITED WITH CODE {}\n", output.code.unwrap_or(-1)),
            )
            .await?;
        }
        Ok(output)
    }

    async fn sync_source(&self, dir: &Utf8Path) -> Result<(), PrepareError> {
        let target = self.environment.execution_target.as_ref();
        tracing::info!(node = target.name(), source = %dir, workdir = self.workdir, "syncing source");
        append_log(self.log, &format!("### sync {dir} -> {}:{}\n", target.name(), self.workdir)).await?;
        let contents = Utf8PathBuf::from(format!("{}/.", dir.as_str().trim_end_matches('/')));
        target.copy_in(&contents, self.workdir).await?;
        Ok(())
    }

    async fn deploy_ostree(&self, target: &dyn RemoteTarget, spec: &OstreeSpec) -> Result<(), PrepareError> {
        tracing::info!(node = target.name(), "deploying OSTree");
        if !self.step(target, "test -e /run/ostree-booted").await?.is_success() {
            return Err(PrepareError::User(String::from(
                "cannot deploy on a non-OSTree host",
            )));
        }

        for script in ostree_commands(spec) {
            if !self.step(target, &script).await?.is_success() {
                return Err(PrepareError::User(format!(
                    "failed to deploy OSTree on {}: {script}",
                    target.name()
                )));
            }
        }
        target.reboot().await?;
        Ok(())
    }

    async fn install_repos(&self, targets: &[PackageTarget]) -> Result<(), PrepareError> {
        let local = self.staging_dir.join(REPO_FILE_NAME);
        write_ambient(&local, render_repo_file(&self.suite.extra_repos).as_bytes())
            .map_err(PrepareError::Stage)?;
        let remote = format!("{REPO_DIR}/{REPO_FILE_NAME}");
        for package_target in targets {
            append_log(
                self.log,
                &format!("### [{}] install {remote}\n", package_target.target.name()),
            )
            .await?;
            package_target.target.copy_in(&local, &remote).await?;
        }
        Ok(())
    }

    async fn refresh_cache(&self, package_target: &PackageTarget) -> Result<(), PrepareError> {
        if package_target.ostree {
            return Ok(());
        }
        let target = package_target.target.as_ref();
        for attempt in 1..=MAKECACHE_ATTEMPTS {
            if self.step(target, "yum makecache").await?.is_success() {
                return Ok(());
            }
            tracing::debug!(node = target.name(), attempt, "package cache refresh failed");
        }
        tracing::warn!(
            node = target.name(),
            attempts = MAKECACHE_ATTEMPTS,
            "package cache refresh kept failing; continuing"
        );
        Ok(())
    }

    async fn install_packages(&self, package_target: &PackageTarget) -> Result<(), PrepareError> {
        let target = package_target.target.as_ref();
        let packages = shell_words(&self.suite.packages);
        tracing::info!(node = target.name(), count = self.suite.packages.len(), "installing packages");
        let script = if package_target.ostree {
            format!("rpm-ostree install {packages}")
        } else {
            format!("yum install -y {packages}")
        };
        if !self.step(target, &script).await?.is_success() {
            return Err(PrepareError::User(String::from("failed to install packages")));
        }
        if package_target.ostree {
            target.reboot().await?;
        }
        Ok(())
    }
}

fn shell_words(words: &[String]) -> String {
    words
        .iter()
        .map(|word| shell_escape::unix::escape(word.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Commands that bring an OSTree host to the requested deployment.
///
/// With no remote, branch or revision the host is upgraded in place.
#[must_use]
pub fn ostree_commands(spec: &OstreeSpec) -> Vec<String> {
    let escape = |value: &str| shell_escape::unix::escape(value.into()).into_owned();
    let mut commands = Vec::new();
    match (spec.remote.as_deref(), spec.branch.as_deref()) {
        (None, None) if spec.revision.is_none() => commands.push(String::from("rpm-ostree upgrade")),
        (None, None) => {}
        (remote, branch) => {
            let refspec = match (remote, branch) {
                (Some(name), Some(refname)) => format!("{name}:{refname}"),
                (Some(name), None) => format!("{name}:"),
                (None, refname) => refname.unwrap_or_default().to_owned(),
            };
            commands.push(format!("rpm-ostree rebase {}", escape(&refspec)));
        }
    }
    if let Some(revision) = spec.revision.as_deref() {
        commands.push(format!("rpm-ostree deploy {}", escape(revision)));
    }
    commands
}

#[cfg(test)]
mod tests;
