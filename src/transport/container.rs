//! Container-exec backend.
//!
//! The container CLI takes an argv vector, so nothing here is re-parsed by a
//! shell on the way in.

use std::ffi::OsString;
use std::sync::Arc;

use camino::Utf8Path;

use super::{
    CommandOutput, CommandRunner, ExecOptions, QUERY_TIMEOUT, RemoteTarget, ScriptStager,
    TargetFuture, TransportConfig, TransportError, ensure_local_dir, remote_destination_dir,
    run_checked,
};

/// A running container instance.
#[derive(Clone, Debug)]
pub struct ContainerTarget<R> {
    runner: Arc<R>,
    config: Arc<TransportConfig>,
    name: String,
    id: String,
    stager: ScriptStager,
}

impl<R: CommandRunner> ContainerTarget<R> {
    /// Creates a target for container `id`.
    #[must_use]
    pub fn new(
        runner: Arc<R>,
        config: Arc<TransportConfig>,
        name: &str,
        id: &str,
        stager: ScriptStager,
    ) -> Self {
        Self {
            runner,
            config,
            name: name.to_owned(),
            id: id.to_owned(),
            stager,
        }
    }

    fn container_path(&self, path: &str) -> OsString {
        OsString::from(format!("{}:{path}", self.id))
    }

    async fn cli(&self, args: Vec<OsString>) -> Result<CommandOutput, TransportError> {
        run_checked(
            self.runner.as_ref(),
            &self.config.container_bin,
            &args,
            ExecOptions::with_timeout(QUERY_TIMEOUT),
        )
        .await
    }

    async fn mkdir(&self, dir: &str) -> Result<(), TransportError> {
        self.cli(vec![
            OsString::from("exec"),
            OsString::from(&self.id),
            OsString::from("mkdir"),
            OsString::from("-p"),
            OsString::from(dir),
        ])
        .await
        .map(|_| ())
    }
}

impl<R: CommandRunner> RemoteTarget for ContainerTarget<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn exec<'a>(
        &'a self,
        script: &'a str,
        options: ExecOptions<'a>,
    ) -> TargetFuture<'a, CommandOutput> {
        Box::pin(async move {
            let staged = self.stager.stage(script)?;
            let copied = self
                .cli(vec![
                    OsString::from("cp"),
                    staged.local.clone().into_string().into(),
                    self.container_path(&staged.remote),
                ])
                .await;
            if let Err(err) = copied {
                staged.discard();
                return Err(err);
            }

            let mut args = vec![OsString::from("exec"), OsString::from(&self.id)];
            args.extend(
                staged
                    .invocation(options.hard_timeout)
                    .into_iter()
                    .map(OsString::from),
            );
            let local = ExecOptions {
                hard_timeout: options
                    .hard_timeout
                    .map(|limit| limit + self.config.kill_grace()),
                log: options.log,
            };
            let result = self
                .runner
                .run(&self.config.container_bin, &args, local)
                .await;
            staged.discard();
            result
        })
    }

    fn copy_in<'a>(&'a self, local: &'a Utf8Path, remote: &'a str) -> TargetFuture<'a, ()> {
        Box::pin(async move {
            self.mkdir(&remote_destination_dir(local, remote)).await?;
            self.cli(vec![
                OsString::from("cp"),
                OsString::from(local.as_str()),
                self.container_path(remote),
            ])
            .await
            .map(|_| ())
        })
    }

    fn copy_out<'a>(&'a self, remote: &'a str, local_dir: &'a Utf8Path) -> TargetFuture<'a, ()> {
        Box::pin(async move {
            ensure_local_dir(local_dir)?;
            self.cli(vec![
                OsString::from("cp"),
                self.container_path(remote),
                OsString::from(format!("{}/", local_dir.as_str().trim_end_matches('/'))),
            ])
            .await
            .map(|_| ())
        })
    }

    fn reboot(&self) -> TargetFuture<'_, ()> {
        Box::pin(async move {
            Err(TransportError::Unsupported {
                target: self.name.clone(),
                operation: String::from("reboot"),
            })
        })
    }
}
