//! Remote execution over container exec or SSH.
//!
//! Every command is written to a script file, copied to the target and
//! invoked by path under `timeout --signal=KILL`, so shell metacharacters
//! behave the same on both backends. The local client gets a second,
//! slightly later kill (the configured grace) in case the remote side hangs.

mod config;
mod container;
mod runner;
mod script;
mod ssh;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::backend::UserFacing;

pub use config::{DEFAULT_KILL_GRACE_SECS, DEFAULT_REMOTE_SCRATCH_DIR, TransportConfig};
pub use container::ContainerTarget;
pub use runner::{
    CommandOutput, CommandRunner, ExecOptions, ProcessCommandRunner, RunnerFuture, run_checked,
};
pub use script::{ScriptStager, StagedScript, timeout_secs};
pub use ssh::SshTarget;

/// Return code for a command killed on its hard timeout (128 + SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

/// Return code for a command that never started because the budget ran out.
pub const TIMED_OUT_EXIT_CODE: i32 = 124;

/// Errors surfaced while talking to a target.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a transport command exits non-zero.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when a local log file cannot be opened.
    #[error("failed to open log {path}: {message}")]
    Log {
        /// Log path.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a script cannot be staged locally.
    #[error("failed to stage script: {0}")]
    Stage(String),
    /// Raised when a target does not support an operation.
    #[error("{operation} is not supported on {target}")]
    Unsupported {
        /// Target name.
        target: String,
        /// Operation attempted.
        operation: String,
    },
    /// Raised when a rebooted host does not come back.
    #[error("{target} did not come back after reboot")]
    RebootTimeout {
        /// Target name.
        target: String,
    },
}

impl UserFacing for TransportError {
    fn is_user_error(&self) -> bool {
        false
    }
}

/// A reachable host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Node {
    /// Host name as declared by the suite.
    pub name: String,
    /// Address the orchestrator connects to.
    pub address: String,
    /// SSH port.
    pub port: u16,
}

/// Future returned by [`RemoteTarget`] operations.
pub type TargetFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Capability interface over a container instance or a host.
///
/// Copies accept a source ending in `/.` to mean "the contents of this
/// directory". Parent directories of the destination are created on both
/// backends.
pub trait RemoteTarget: Send + Sync {
    /// Name used in logs and artifact paths.
    fn name(&self) -> &str;

    /// Runs `script` through `sh` on the target.
    ///
    /// A finite `hard_timeout` kills the remote process group when it
    /// elapses; the output then reports [`KILLED_EXIT_CODE`].
    fn exec<'a>(&'a self, script: &'a str, options: ExecOptions<'a>)
    -> TargetFuture<'a, CommandOutput>;

    /// Copies a local file or tree onto the target.
    fn copy_in<'a>(&'a self, local: &'a Utf8Path, remote: &'a str) -> TargetFuture<'a, ()>;

    /// Copies a remote file or tree into the local directory `local_dir`,
    /// keeping its base name. `local_dir` is created when missing.
    fn copy_out<'a>(&'a self, remote: &'a str, local_dir: &'a Utf8Path) -> TargetFuture<'a, ()>;

    /// Reboots the target and waits until it accepts commands again.
    fn reboot(&self) -> TargetFuture<'_, ()>;

    /// Returns whether `remote` exists on the target.
    fn exists<'a>(&'a self, remote: &'a str) -> TargetFuture<'a, bool> {
        Box::pin(async move {
            let script = format!("test -e {}", shell_escape::unix::escape(remote.into()));
            let output = self
                .exec(&script, ExecOptions::with_timeout(QUERY_TIMEOUT))
                .await?;
            Ok(output.is_success())
        })
    }
}

/// Returns `true` when `local` names the contents of a directory (`dir/.`).
fn is_contents_copy(local: &Utf8Path) -> bool {
    local.as_str().ends_with("/.") || local.as_str() == "."
}

/// Remote directory that must exist before copying `local` to `remote`.
fn remote_destination_dir(local: &Utf8Path, remote: &str) -> String {
    if is_contents_copy(local) {
        return remote.trim_end_matches('/').to_owned();
    }
    match remote.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => String::from("/"),
        Some((parent, _)) => parent.to_owned(),
        None => String::from("."),
    }
}

/// Creates a local copy destination directory.
fn ensure_local_dir(dir: &Utf8Path) -> Result<(), TransportError> {
    cap_std::fs_utf8::Dir::create_ambient_dir_all(dir, cap_std::ambient_authority())
        .map_err(|err| TransportError::Stage(format!("cannot create {dir}: {err}")))
}

/// Hard timeout applied to short bookkeeping commands.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(120);

/// Builds targets for provisioned resources.
pub trait TargetFactory: Send + Sync {
    /// Returns a target for a host.
    fn host(&self, node: &Node) -> Arc<dyn RemoteTarget>;

    /// Returns a target for a running container instance.
    fn container(&self, name: &str, id: &str) -> Arc<dyn RemoteTarget>;
}

/// [`TargetFactory`] producing real SSH and container targets.
#[derive(Clone, Debug)]
pub struct TransportFactory<R> {
    runner: Arc<R>,
    config: Arc<TransportConfig>,
    staging_dir: Utf8PathBuf,
}

impl<R: CommandRunner + 'static> TransportFactory<R> {
    /// Creates a factory staging scripts under `staging_dir`.
    #[must_use]
    pub const fn new(runner: Arc<R>, config: Arc<TransportConfig>, staging_dir: Utf8PathBuf) -> Self {
        Self {
            runner,
            config,
            staging_dir,
        }
    }

    fn stager(&self) -> ScriptStager {
        ScriptStager::new(
            self.staging_dir.clone(),
            self.config.remote_scratch_dir.clone(),
        )
    }
}

impl<R: CommandRunner + 'static> TargetFactory for TransportFactory<R> {
    fn host(&self, node: &Node) -> Arc<dyn RemoteTarget> {
        Arc::new(SshTarget::new(
            Arc::clone(&self.runner),
            Arc::clone(&self.config),
            node.clone(),
            self.stager(),
        ))
    }

    fn container(&self, name: &str, id: &str) -> Arc<dyn RemoteTarget> {
        Arc::new(ContainerTarget::new(
            Arc::clone(&self.runner),
            Arc::clone(&self.config),
            name,
            id,
            self.stager(),
        ))
    }
}
