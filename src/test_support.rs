//! Test doubles shared by unit and integration tests.
//!
//! Every double records what it was asked to do behind an `Arc<Mutex<_>>`,
//! so clones handed to the code under test report back to the test.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::backend::{
    Backend, BackendFuture, InstanceHandle, InstanceNetworking, InstanceRequest, UserFacing,
};
use crate::status::{Notifier, NotifyError, NotifyFuture, StatusReport};
use crate::transport::{
    CommandOutput, CommandRunner, ExecOptions, KILLED_EXIT_CODE, Node, RemoteTarget,
    RunnerFuture, TargetFactory, TargetFuture, TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Hard timeout requested by the caller.
    pub hard_timeout: Option<Duration>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Once the queue is empty the runner either fails with
/// [`TransportError::Spawn`] or, when built with
/// [`ScriptedRunner::permissive`], succeeds with empty output.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
    permissive: bool,
}

impl ScriptedRunner {
    /// Creates a runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that succeeds whenever nothing is queued.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::default()
        }
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Returns the recorded invocations as command strings.
    #[must_use]
    pub fn command_strings(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes an explicit command output response.
    pub fn push_output(&self, code: Option<i32>, stdout: impl Into<String>, stderr: impl Into<String>) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            killed: false,
        });
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit with `stdout`.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes a response for a process killed on its hard timeout.
    pub fn push_killed(&self) {
        lock(&self.responses).push_back(CommandOutput {
            code: Some(KILLED_EXIT_CODE),
            stdout: String::new(),
            stderr: String::new(),
            killed: true,
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        options: ExecOptions<'a>,
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            lock(&self.invocations).push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
                hard_timeout: options.hard_timeout,
            });
            let next = lock(&self.responses).pop_front();
            match next {
                Some(output) => Ok(output),
                None if self.permissive => Ok(CommandOutput {
                    code: Some(0),
                    ..CommandOutput::default()
                }),
                None => Err(TransportError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                }),
            }
        })
    }
}

/// One `exec` call observed by a [`ScriptedTarget`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecRecord {
    /// Script body.
    pub script: String,
    /// Hard timeout requested by the caller.
    pub hard_timeout: Option<Duration>,
}

/// Queued behaviour for one `exec` call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptedExec {
    /// Exit code the command reports.
    pub code: i32,
    /// Simulated run time.
    pub duration: Duration,
    /// Text written to the log and returned as stdout.
    pub output: String,
    /// Whether the call panics instead of finishing.
    pub panics: bool,
}

impl ScriptedExec {
    /// An instant exit with `code`.
    #[must_use]
    pub const fn exit(code: i32) -> Self {
        Self {
            code,
            duration: Duration::ZERO,
            output: String::new(),
            panics: false,
        }
    }

    /// A call that panics, standing in for a bug inside a stage.
    #[must_use]
    pub const fn panicking() -> Self {
        Self {
            code: 0,
            duration: Duration::ZERO,
            output: String::new(),
            panics: true,
        }
    }

    /// Returns a copy that takes `duration` to finish.
    #[must_use]
    pub const fn lasting(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Returns a copy that prints `output`.
    #[must_use]
    pub fn printing(mut self, output: &str) -> Self {
        self.output = output.to_owned();
        self
    }
}

#[derive(Debug, Default)]
struct TargetState {
    execs: Vec<ExecRecord>,
    queue: VecDeque<ScriptedExec>,
    existing: BTreeSet<String>,
    copies_in: Vec<(Utf8PathBuf, String)>,
    copies_out: Vec<(String, Utf8PathBuf)>,
    reboots: usize,
}

/// In-memory [`RemoteTarget`].
///
/// Unqueued commands succeed instantly. Queued commands that outlast their
/// hard timeout are cut off at the timeout and report
/// [`KILLED_EXIT_CODE`], as the remote `timeout --signal=KILL` would.
#[derive(Clone, Debug)]
pub struct ScriptedTarget {
    name: String,
    state: Arc<Mutex<TargetState>>,
}

impl ScriptedTarget {
    /// Creates a target called `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: Arc::new(Mutex::new(TargetState::default())),
        }
    }

    /// Queues the behaviour of the next unclaimed `exec`.
    pub fn push_exec(&self, exec: ScriptedExec) {
        lock(&self.state).queue.push_back(exec);
    }

    /// Marks `remote` as present on the target.
    pub fn add_path(&self, remote: &str) {
        lock(&self.state).existing.insert(remote.to_owned());
    }

    /// Every `exec` seen so far.
    #[must_use]
    pub fn execs(&self) -> Vec<ExecRecord> {
        lock(&self.state).execs.clone()
    }

    /// Script bodies seen so far.
    #[must_use]
    pub fn scripts(&self) -> Vec<String> {
        self.execs().into_iter().map(|record| record.script).collect()
    }

    /// Files copied onto the target.
    #[must_use]
    pub fn copies_in(&self) -> Vec<(Utf8PathBuf, String)> {
        lock(&self.state).copies_in.clone()
    }

    /// Paths copied off the target.
    #[must_use]
    pub fn copies_out(&self) -> Vec<(String, Utf8PathBuf)> {
        lock(&self.state).copies_out.clone()
    }

    /// Number of reboots requested.
    #[must_use]
    pub fn reboots(&self) -> usize {
        lock(&self.state).reboots
    }
}

fn append_test_log(log: &Utf8Path, text: &str) -> Result<(), TransportError> {
    let log_error = |err: std::io::Error| TransportError::Log {
        path: log.to_string(),
        message: err.to_string(),
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log.as_std_path())
        .map_err(log_error)?;
    file.write_all(text.as_bytes()).map_err(log_error)
}

impl RemoteTarget for ScriptedTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn exec<'a>(&'a self, script: &'a str, options: ExecOptions<'a>) -> TargetFuture<'a, CommandOutput> {
        Box::pin(async move {
            let planned = {
                let mut state = lock(&self.state);
                state.execs.push(ExecRecord {
                    script: script.to_owned(),
                    hard_timeout: options.hard_timeout,
                });
                state.queue.pop_front()
            }
            .unwrap_or_else(|| ScriptedExec::exit(0));
            assert!(!planned.panics, "scripted exec panicked running {script:?}");

            let killed = options
                .hard_timeout
                .is_some_and(|limit| planned.duration > limit);
            let ran_for = match options.hard_timeout {
                Some(limit) if killed => limit,
                _ => planned.duration,
            };
            tokio::time::sleep(ran_for).await;

            if let Some(log) = options.log {
                append_test_log(log, &planned.output)?;
            }
            Ok(CommandOutput {
                code: Some(if killed { KILLED_EXIT_CODE } else { planned.code }),
                stdout: planned.output,
                stderr: String::new(),
                killed: false,
            })
        })
    }

    fn copy_in<'a>(&'a self, local: &'a Utf8Path, remote: &'a str) -> TargetFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.copies_in.push((local.to_owned(), remote.to_owned()));
            state.existing.insert(remote.to_owned());
            Ok(())
        })
    }

    fn copy_out<'a>(&'a self, remote: &'a str, local_dir: &'a Utf8Path) -> TargetFuture<'a, ()> {
        Box::pin(async move {
            let present = {
                let mut state = lock(&self.state);
                state.copies_out.push((remote.to_owned(), local_dir.to_owned()));
                state.existing.contains(remote)
            };
            if !present {
                return Err(TransportError::CommandFailure {
                    program: String::from("copy"),
                    status: Some(1),
                    status_text: String::from("1"),
                    stderr: format!("{remote}: no such file"),
                });
            }
            let file_name = Utf8Path::new(remote).file_name().unwrap_or("artifact");
            crate::util::write_ambient(&local_dir.join(file_name), remote.as_bytes())
                .map_err(TransportError::Stage)
        })
    }

    fn reboot(&self) -> TargetFuture<'_, ()> {
        Box::pin(async move {
            lock(&self.state).reboots += 1;
            Ok(())
        })
    }

    fn exists<'a>(&'a self, remote: &'a str) -> TargetFuture<'a, bool> {
        Box::pin(async move { Ok(lock(&self.state).existing.contains(remote)) })
    }
}

/// [`TargetFactory`] handing out [`ScriptedTarget`]s by name.
///
/// Targets registered up front are returned as-is, so tests can queue
/// behaviour before provisioning creates them.
#[derive(Clone, Debug, Default)]
pub struct ScriptedFactory {
    targets: Arc<Mutex<BTreeMap<String, ScriptedTarget>>>,
}

impl ScriptedFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the target called `name`, creating it when missing.
    #[must_use]
    pub fn target(&self, name: &str) -> ScriptedTarget {
        lock(&self.targets)
            .entry(name.to_owned())
            .or_insert_with(|| ScriptedTarget::new(name))
            .clone()
    }
}

impl TargetFactory for ScriptedFactory {
    fn host(&self, node: &Node) -> Arc<dyn RemoteTarget> {
        Arc::new(self.target(&node.name))
    }

    fn container(&self, name: &str, _id: &str) -> Arc<dyn RemoteTarget> {
        Arc::new(self.target(name))
    }
}

/// Error produced by [`ScriptedBackend`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct ScriptedBackendError {
    /// Failure text.
    pub message: String,
    /// Whether the failure is attributable to the suite.
    pub user: bool,
}

impl UserFacing for ScriptedBackendError {
    fn is_user_error(&self) -> bool {
        self.user
    }
}

#[derive(Debug, Default)]
struct BackendState {
    create_failures: BTreeMap<String, ScriptedBackendError>,
    destroy_failures: BTreeSet<String>,
    created: Vec<InstanceHandle>,
    destroyed: Vec<String>,
    next_host: u8,
}

/// In-memory [`Backend`] keyed by host name.
///
/// Instance names end in `-<host>`; failures are configured per host.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<BackendState>>,
}

impl ScriptedBackend {
    /// Creates a backend where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes creation of `host` fail.
    pub fn fail_create(&self, host: &str, user: bool) {
        lock(&self.state).create_failures.insert(
            host.to_owned(),
            ScriptedBackendError {
                message: format!("cannot create {host}"),
                user,
            },
        );
    }

    /// Makes destruction of instances named `name` fail.
    pub fn fail_destroy(&self, name: &str) {
        lock(&self.state).destroy_failures.insert(name.to_owned());
    }

    /// Handles returned by successful creations, in order.
    #[must_use]
    pub fn created(&self) -> Vec<InstanceHandle> {
        lock(&self.state).created.clone()
    }

    /// Names passed to `destroy`, in order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        lock(&self.state).destroyed.clone()
    }
}

impl Backend for ScriptedBackend {
    type Error = ScriptedBackendError;

    fn create<'a>(&'a self, request: &'a InstanceRequest) -> BackendFuture<'a, InstanceHandle, Self::Error> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let failure = state
                .create_failures
                .iter()
                .find(|(host, _)| request.name.ends_with(&format!("-{host}")))
                .map(|(_, err)| err.clone());
            if let Some(err) = failure {
                return Err(err);
            }
            let handle = InstanceHandle {
                id: format!("srv-{}", request.name),
                name: request.name.clone(),
                zone: request.zone.clone(),
                floating_ip: request.floating_ip.then(|| format!("ip-{}", request.name)),
            };
            state.created.push(handle.clone());
            Ok(handle)
        })
    }

    fn wait_for_ready<'a>(&'a self, _handle: &'a InstanceHandle) -> BackendFuture<'a, InstanceNetworking, Self::Error> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.next_host = state.next_host.saturating_add(1);
            Ok(InstanceNetworking {
                public_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, state.next_host)),
                ssh_port: 22,
            })
        })
    }

    fn destroy(&self, handle: InstanceHandle) -> BackendFuture<'_, (), Self::Error> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.destroyed.push(handle.name.clone());
            if state.destroy_failures.contains(&handle.name) {
                return Err(ScriptedBackendError {
                    message: format!("cannot delete {}", handle.name),
                    user: false,
                });
            }
            Ok(())
        })
    }
}

/// [`Notifier`] that records every report.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    reports: Arc<Mutex<Vec<StatusReport>>>,
    failing: bool,
}

impl RecordingNotifier {
    /// Creates a notifier that accepts every report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a notifier that records reports and then fails delivery.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Reports in send order.
    #[must_use]
    pub fn reports(&self) -> Vec<StatusReport> {
        lock(&self.reports).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify<'a>(&'a self, report: &'a StatusReport) -> NotifyFuture<'a> {
        Box::pin(async move {
            lock(&self.reports).push(report.clone());
            if self.failing {
                return Err(NotifyError::Request(String::from("simulated outage")));
            }
            Ok(())
        })
    }
}

/// Produces a payload shaped like `scw instance <kind> list -o json`.
#[must_use]
pub fn json_tagged(items: &[(&str, &str, &[&str])]) -> String {
    let entries = items
        .iter()
        .map(|(id, zone, tags)| {
            serde_json::json!({ "id": id, "zone": zone, "tags": tags }).to_string()
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("[{entries}]")
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: tokio::sync::MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
