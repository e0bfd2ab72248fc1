//! Timeout-bounded phase execution.
//!
//! A phase is an ordered list of command lines run against one target. The
//! build and test phases share a single [`DeadlineBudget`]: each command is
//! started with whatever time remains, and once nothing remains the phase
//! stops with [`PhaseOutcome::TimedOut`] without starting another command.

mod build;

use std::time::Duration;

use camino::Utf8Path;
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::transport::{
    CommandOutput, ExecOptions, KILLED_EXIT_CODE, RemoteTarget, TIMED_OUT_EXIT_CODE,
    TransportError,
};

pub use build::build_lines;

/// Exit code recorded when a command ended without one.
pub const UNKNOWN_EXIT_CODE: i32 = 255;

/// Absolute deadline shared by the build and test phases.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeadlineBudget {
    deadline: Instant,
}

impl DeadlineBudget {
    /// Starts a budget of `total` from now.
    #[must_use]
    pub fn start(total: Duration) -> Self {
        Self {
            deadline: Instant::now() + total,
        }
    }

    /// Time left, or `None` once the deadline has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
    }

    /// Returns `true` once the deadline has passed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_none()
    }
}

/// How a phase, or a single command, ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PhaseOutcome {
    /// Every command exited zero.
    Success,
    /// A command exited with this non-zero code.
    Failed(i32),
    /// The budget ran out before a command could start.
    TimedOut,
    /// A command was killed on its hard timeout.
    Killed,
}

impl PhaseOutcome {
    /// Classifies one command's output.
    #[must_use]
    pub const fn from_output(output: &CommandOutput) -> Self {
        if output.was_killed() {
            return Self::Killed;
        }
        match output.code {
            Some(0) => Self::Success,
            Some(code) => Self::Failed(code),
            None => Self::Failed(UNKNOWN_EXIT_CODE),
        }
    }

    /// Numeric result code (`124` for budget exhaustion, `137` for a kill).
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed(code) => code,
            Self::TimedOut => TIMED_OUT_EXIT_CODE,
            Self::Killed => KILLED_EXIT_CODE,
        }
    }

    /// Returns `true` for [`PhaseOutcome::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Errors that stop a phase without a command outcome.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// The target could not be reached.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The phase log could not be written.
    #[error("failed to write {path}: {message}")]
    Log {
        /// Log path.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Appends `text` to the log at `path`, creating it when missing.
///
/// # Errors
///
/// Returns [`PhaseError::Log`] when the file cannot be opened or written.
pub async fn append_log(path: &Utf8Path, text: &str) -> Result<(), PhaseError> {
    let log_error = |err: std::io::Error| PhaseError::Log {
        path: path.to_string(),
        message: err.to_string(),
    };
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_std_path())
        .await
        .map_err(log_error)?;
    file.write_all(text.as_bytes()).await.map_err(log_error)?;
    file.flush().await.map_err(log_error)
}

/// Runs phases against one target with fixed environment and workdir.
#[derive(Clone, Copy)]
pub struct PhaseExecutor<'a> {
    target: &'a dyn RemoteTarget,
    env: &'a [(String, String)],
    workdir: &'a str,
}

impl std::fmt::Debug for PhaseExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseExecutor")
            .field("target", &self.target.name())
            .field("env", &self.env)
            .field("workdir", &self.workdir)
            .finish()
    }
}

impl<'a> PhaseExecutor<'a> {
    /// Creates an executor.
    #[must_use]
    pub const fn new(
        target: &'a dyn RemoteTarget,
        env: &'a [(String, String)],
        workdir: &'a str,
    ) -> Self {
        Self {
            target,
            env,
            workdir,
        }
    }

    /// Wraps `line` with the environment, the workdir and stderr folding.
    #[must_use]
    pub fn compose_script(&self, line: &str) -> String {
        let mut script = String::new();
        for (key, value) in self.env {
            script.push_str(&format!("export {key}={}\n", escape(value.as_str().into())));
        }
        script.push_str(&format!(
            "cd {} || exit 1\nexec 2>&1\n{line}",
            escape(self.workdir.into())
        ));
        script
    }

    /// Runs `lines` in order under `budget`, streaming output into `log`.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError`] when the target or the log fails; command
    /// failures and timeouts are outcomes, not errors.
    pub async fn run(
        &self,
        phase: &str,
        lines: &[String],
        budget: &DeadlineBudget,
        log: &Utf8Path,
    ) -> Result<PhaseOutcome, PhaseError> {
        tracing::info!(phase, node = self.target.name(), commands = lines.len(), "phase started");
        for line in lines {
            let Some(remaining) = budget.remaining() else {
                append_log(log, "### TIMED OUT\n").await?;
                tracing::warn!(phase, "budget exhausted before next command");
                return Ok(PhaseOutcome::TimedOut);
            };

            append_log(log, &format!("### {line}\n")).await?;
            let started = Instant::now();
            let output = self
                .target
                .exec(
                    &self.compose_script(line),
                    ExecOptions::with_timeout(remaining).logged(log),
                )
                .await?;
            let elapsed_secs = started.elapsed().as_secs();
            let outcome = PhaseOutcome::from_output(&output);

            let trailer = match outcome {
                PhaseOutcome::Success => format!("### COMPLETED IN {elapsed_secs}s\n"),
                PhaseOutcome::Killed | PhaseOutcome::TimedOut => {
                    format!("### TIMED OUT AFTER {elapsed_secs}s\n")
                }
                PhaseOutcome::Failed(code) => {
                    format!("### EXITED WITH CODE {code} AFTER {elapsed_secs}s\n")
                }
            };
            append_log(log, &trailer).await?;
            tracing::info!(phase, code = outcome.code(), elapsed_secs, "command finished");

            if !outcome.is_success() {
                tracing::warn!(phase, code = outcome.code(), "phase stopped");
                return Ok(outcome);
            }
        }
        tracing::info!(phase, "phase completed");
        Ok(PhaseOutcome::Success)
    }
}
