//! SSH and rsync backend.
//!
//! `ssh` joins its trailing arguments into one string that the remote login
//! shell parses again, so every remote word is escaped with
//! `shell_escape` before it is sent.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use shell_escape::unix::escape;
use tokio::time::{Instant, sleep};

use super::{
    CommandOutput, CommandRunner, ExecOptions, Node, RemoteTarget, ScriptStager, TargetFuture,
    TransportConfig, TransportError, ensure_local_dir, is_contents_copy,
    remote_destination_dir, run_checked,
};

const COPY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const REBOOT_SETTLE: Duration = Duration::from_secs(10);
const REBOOT_POLL: Duration = Duration::from_secs(5);
const REBOOT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// A host reached over SSH.
#[derive(Clone, Debug)]
pub struct SshTarget<R> {
    runner: Arc<R>,
    config: Arc<TransportConfig>,
    node: Node,
    stager: ScriptStager,
}

fn escape_words(words: &[String]) -> String {
    words
        .iter()
        .map(|word| escape(word.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

impl<R: CommandRunner> SshTarget<R> {
    /// Creates a target for `node`.
    #[must_use]
    pub const fn new(
        runner: Arc<R>,
        config: Arc<TransportConfig>,
        node: Node,
        stager: ScriptStager,
    ) -> Self {
        Self {
            runner,
            config,
            node,
            stager,
        }
    }

    fn login(&self) -> String {
        format!("{}@{}", self.config.ssh_user, self.node.address)
    }

    fn remote_shell(&self) -> String {
        let mut words = vec![self.config.ssh_bin.clone()];
        words.extend(self.config.ssh_options(self.node.port));
        escape_words(&words)
    }

    /// Builds the `ssh` argv for a remote command given as separate words.
    #[must_use]
    pub fn ssh_args(&self, words: &[String]) -> Vec<OsString> {
        let mut args: Vec<OsString> = self
            .config
            .ssh_options(self.node.port)
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(OsString::from(self.login()));
        args.push(OsString::from(escape_words(words)));
        args
    }

    /// Builds the `rsync` argv for a transfer, creating `mkdir_on_remote`
    /// first when given.
    #[must_use]
    pub fn rsync_args(&self, source: &str, dest: &str, mkdir_on_remote: Option<&str>) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-a"),
            OsString::from("--rsh"),
            OsString::from(self.remote_shell()),
        ];
        if let Some(dir) = mkdir_on_remote {
            args.push(OsString::from(format!(
                "--rsync-path=mkdir -p {} && rsync",
                escape(dir.into())
            )));
        }
        args.push(OsString::from(source));
        args.push(OsString::from(dest));
        args
    }

    fn rsync_source(path: &str) -> String {
        if !is_contents_copy(Utf8Path::new(path)) {
            return path.to_owned();
        }
        match path.strip_suffix("/.") {
            Some(dir) => format!("{dir}/"),
            None => String::from("./"),
        }
    }

    async fn rsync(&self, args: &[OsString]) -> Result<(), TransportError> {
        run_checked(
            self.runner.as_ref(),
            &self.config.rsync_bin,
            args,
            ExecOptions::with_timeout(COPY_TIMEOUT),
        )
        .await
        .map(|_| ())
    }

    async fn probe(&self) -> bool {
        let args = self.ssh_args(&[String::from("true")]);
        self.runner
            .run(
                &self.config.ssh_bin,
                &args,
                ExecOptions::with_timeout(PROBE_TIMEOUT),
            )
            .await
            .is_ok_and(|output| output.is_success())
    }
}

impl<R: CommandRunner> RemoteTarget for SshTarget<R> {
    fn name(&self) -> &str {
        &self.node.name
    }

    fn exec<'a>(
        &'a self,
        script: &'a str,
        options: ExecOptions<'a>,
    ) -> TargetFuture<'a, CommandOutput> {
        Box::pin(async move {
            let staged = self.stager.stage(script)?;
            let dest = format!("{}:{}", self.login(), staged.remote);
            let copied = self
                .rsync(&self.rsync_args(staged.local.as_str(), &dest, None))
                .await;
            if let Err(err) = copied {
                staged.discard();
                return Err(err);
            }

            let args = self.ssh_args(&staged.invocation(options.hard_timeout));
            let local = ExecOptions {
                hard_timeout: options
                    .hard_timeout
                    .map(|limit| limit + self.config.kill_grace()),
                log: options.log,
            };
            let result = self.runner.run(&self.config.ssh_bin, &args, local).await;
            staged.discard();
            result
        })
    }

    fn copy_in<'a>(&'a self, local: &'a Utf8Path, remote: &'a str) -> TargetFuture<'a, ()> {
        Box::pin(async move {
            let dir = remote_destination_dir(local, remote);
            let dest = format!("{}:{remote}", self.login());
            let args = self.rsync_args(&Self::rsync_source(local.as_str()), &dest, Some(&dir));
            self.rsync(&args).await
        })
    }

    fn copy_out<'a>(&'a self, remote: &'a str, local_dir: &'a Utf8Path) -> TargetFuture<'a, ()> {
        Box::pin(async move {
            ensure_local_dir(local_dir)?;
            let source = format!("{}:{}", self.login(), Self::rsync_source(remote));
            let dest = format!("{}/", local_dir.as_str().trim_end_matches('/'));
            let args = self.rsync_args(&source, &dest, None);
            self.rsync(&args).await
        })
    }

    fn reboot(&self) -> TargetFuture<'_, ()> {
        Box::pin(async move {
            let args = self.ssh_args(&[String::from("systemctl"), String::from("reboot")]);
            // The connection usually drops before ssh reports a status.
            self.runner
                .run(
                    &self.config.ssh_bin,
                    &args,
                    ExecOptions::with_timeout(PROBE_TIMEOUT),
                )
                .await?;
            tracing::info!(node = %self.node.name, "rebooting");

            let deadline = Instant::now() + REBOOT_TIMEOUT;
            sleep(REBOOT_SETTLE).await;
            while Instant::now() <= deadline {
                if self.probe().await {
                    tracing::info!(node = %self.node.name, "back after reboot");
                    return Ok(());
                }
                sleep(REBOOT_POLL).await;
            }
            Err(TransportError::RebootTimeout {
                target: self.node.name.clone(),
            })
        })
    }
}
