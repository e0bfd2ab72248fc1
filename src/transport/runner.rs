//! Local process execution with streaming capture and a hard kill.

use std::ffi::OsString;
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{KILLED_EXIT_CODE, TransportError};

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Whether the runner killed the process on its hard timeout.
    pub killed: bool,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Returns `true` when the process was killed on a hard timeout, either
    /// locally or by the remote `timeout` wrapper.
    #[must_use]
    pub const fn was_killed(&self) -> bool {
        self.killed || matches!(self.code, Some(KILLED_EXIT_CODE))
    }
}

/// Per-invocation execution options.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecOptions<'a> {
    /// Kill the process group once this much time has elapsed.
    pub hard_timeout: Option<Duration>,
    /// File that receives stdout and stderr as they stream.
    pub log: Option<&'a Utf8Path>,
}

impl<'a> ExecOptions<'a> {
    /// Options with a hard timeout and no log.
    #[must_use]
    pub const fn with_timeout(hard_timeout: Duration) -> Self {
        Self {
            hard_timeout: Some(hard_timeout),
            log: None,
        }
    }

    /// Returns a copy that streams output into `log`.
    #[must_use]
    pub const fn logged(self, log: &'a Utf8Path) -> Self {
        Self {
            hard_timeout: self.hard_timeout,
            log: Some(log),
        }
    }
}

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, TransportError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] if the command cannot be started.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        options: ExecOptions<'a>,
    ) -> RunnerFuture<'a>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        options: ExecOptions<'a>,
    ) -> RunnerFuture<'a> {
        (**self).run(program, args, options)
    }
}

/// Real command runner that spawns each command in its own process group.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

type SharedLog = Option<Arc<Mutex<File>>>;

async fn open_log(log: Option<&Utf8Path>) -> Result<SharedLog, TransportError> {
    let Some(path) = log else {
        return Ok(None);
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_std_path())
        .await
        .map_err(|err| TransportError::Log {
            path: path.to_string(),
            message: err.to_string(),
        })?;
    Ok(Some(Arc::new(Mutex::new(file))))
}

async fn pump<S: AsyncRead + Unpin>(stream: Option<S>, log: SharedLog) -> String {
    let Some(mut reader) = stream else {
        return String::new();
    };
    let mut captured = Vec::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        let Some(chunk) = buf.get(..read) else {
            break;
        };
        captured.extend_from_slice(chunk);
        if let Some(file) = &log {
            let mut guard = file.lock().await;
            if let Err(err) = guard.write_all(chunk).await {
                tracing::warn!(error = %err, "failed to append command output to log");
            }
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

fn kill_process_group(pid: Option<u32>) {
    let Some(group) = pid.and_then(|raw| libc::pid_t::try_from(raw).ok()) else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions; the group id comes
    // from a child spawned with `process_group(0)`.
    let rc = unsafe { libc::killpg(group, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pgid = group, "process group already gone");
    }
}

fn exit_code(status: &ExitStatus) -> Option<i32> {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        options: ExecOptions<'a>,
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            let spawn_error = |message: String| TransportError::Spawn {
                program: program.to_owned(),
                message,
            };
            let log = open_log(options.log).await?;
            let mut child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .process_group(0)
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| spawn_error(err.to_string()))?;

            let pid = child.id();
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            let waiter = async {
                match options.hard_timeout {
                    Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                        Ok(status) => (status, false),
                        Err(_) => {
                            kill_process_group(pid);
                            (child.wait().await, true)
                        }
                    },
                    None => (child.wait().await, false),
                }
            };

            let ((wait_result, killed), stdout_text, stderr_text) = tokio::join!(
                waiter,
                pump(stdout, log.clone()),
                pump(stderr, log)
            );
            let status = wait_result.map_err(|err| spawn_error(err.to_string()))?;

            Ok(CommandOutput {
                code: if killed {
                    Some(KILLED_EXIT_CODE)
                } else {
                    exit_code(&status)
                },
                stdout: stdout_text,
                stderr: stderr_text,
                killed,
            })
        })
    }
}

/// Runs a command and converts a non-zero exit into
/// [`TransportError::CommandFailure`].
///
/// # Errors
///
/// Returns [`TransportError`] when spawning fails or the command exits
/// non-zero.
pub async fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    args: &[OsString],
    options: ExecOptions<'_>,
) -> Result<CommandOutput, TransportError> {
    let output = runner.run(program, args, options).await?;
    if output.is_success() {
        return Ok(output);
    }
    Err(TransportError::CommandFailure {
        program: program.to_owned(),
        status: output.code,
        status_text: output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string()),
        stderr: output.stderr.trim().to_owned(),
    })
}
