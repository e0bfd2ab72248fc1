//! The run pipeline and its guaranteed epilogue.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use super::{RunContext, RunError, RunReport, RunRequest, RunSettings, RunVerdict};
use crate::artifacts::collect_artifacts;
use crate::backend::Backend;
use crate::phase::{DeadlineBudget, PhaseExecutor, PhaseOutcome, build_lines};
use crate::prepare::{PrepareError, Preparer};
use crate::provision::{ControlMode, ProvisionError, ProvisionSettings, Provisioner};
use crate::publish::{Publication, Publisher};
use crate::status::{Notifier, StatusReporter, StatusState, terminal_for};
use crate::teardown::{TeardownManager, TeardownSummary};
use crate::transport::{CommandRunner, TargetFactory};

/// Description sent when the run fails for reasons outside the suite.
pub const INTERNAL_ERROR_DESCRIPTION: &str = "An internal error occurred";

/// Drives runs against a backend, a command runner and a notifier.
pub struct RunOrchestrator<'a, B, R> {
    backend: &'a B,
    runner: &'a R,
    factory: &'a dyn TargetFactory,
    notifier: &'a dyn Notifier,
    settings: &'a RunSettings,
}

impl<B, R> std::fmt::Debug for RunOrchestrator<'_, B, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOrchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("unknown panic"))
}

/// Terminal state and description for a verdict.
fn terminal_status(verdict: &RunVerdict, merge_verified: bool) -> (StatusState, String) {
    match verdict {
        RunVerdict::Completed(outcome) => terminal_for(*outcome, merge_verified),
        RunVerdict::UserError(message) => (StatusState::Failure, message.clone()),
        RunVerdict::Skipped(reason) => (StatusState::Success, reason.clone()),
    }
}

impl<'a, B, R> RunOrchestrator<'a, B, R>
where
    B: Backend + Sync,
    R: CommandRunner,
{
    /// Creates an orchestrator.
    #[must_use]
    pub const fn new(
        backend: &'a B,
        runner: &'a R,
        factory: &'a dyn TargetFactory,
        notifier: &'a dyn Notifier,
        settings: &'a RunSettings,
    ) -> Self {
        Self {
            backend,
            runner,
            factory,
            notifier,
            settings,
        }
    }

    /// Runs `request`, stopping early when SIGINT or SIGTERM arrives.
    ///
    /// # Errors
    ///
    /// See [`RunOrchestrator::execute_until`].
    pub async fn execute(&self, request: RunRequest) -> Result<RunReport, RunError<B::Error>> {
        self.execute_until(request, super::shutdown_signal()).await
    }

    /// Runs `request`, treating completion of `shutdown` as an interrupt.
    ///
    /// Publishing, the terminal status and teardown happen on every path
    /// once the run has started. Suite problems and failing phases are
    /// reported outcomes, not errors.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] for internal failures, panics, interrupts and
    /// failed teardown; the `error` status has been sent by then.
    pub async fn execute_until<S>(
        &self,
        request: RunRequest,
        shutdown: S,
    ) -> Result<RunReport, RunError<B::Error>>
    where
        S: Future<Output = String>,
    {
        if !request.suite.runs_on_branch(request.branch.as_deref()) {
            let branch = request.branch.unwrap_or_default();
            tracing::info!(context = %request.suite.context, %branch, "branch not selected; skipping");
            return Ok(RunReport {
                verdict: RunVerdict::Skipped(format!("suite does not run on branch {branch}")),
                publication: None,
                teardown: TeardownSummary::default(),
            });
        }

        let reporter = StatusReporter::new(self.notifier, &request.suite.context);
        let context = match RunContext::create(request, &self.settings.state_dir) {
            Ok(context) => context,
            Err(err) => {
                tracing::error!(error = %err, "cannot create run state");
                reporter
                    .finish(StatusState::Error, INTERNAL_ERROR_DESCRIPTION, None)
                    .await;
                return Err(RunError::Bundle(err));
            }
        };
        tracing::info!(
            run_id = %context.request.run_id,
            context = %context.request.suite.context,
            commit = %context.request.commit,
            "run started"
        );

        let pipeline = AssertUnwindSafe(self.pipeline(&context, &reporter)).catch_unwind();
        let result = tokio::select! {
            finished = pipeline => match finished {
                Ok(outcome) => outcome,
                Err(payload) => Err(RunError::Panicked(panic_message(payload.as_ref()))),
            },
            name = shutdown => Err(RunError::Interrupted(name)),
        };

        let publication = self.publish(&context).await;
        let url = publication.as_ref().and_then(|published| published.url.as_deref());
        match &result {
            Ok(verdict) => {
                let (state, description) = terminal_status(verdict, context.request.merge_verified);
                reporter.finish(state, &description, url).await;
            }
            Err(err) => {
                tracing::error!(error = %err, "run failed");
                reporter
                    .finish(StatusState::Error, INTERNAL_ERROR_DESCRIPTION, url)
                    .await;
            }
        }

        let teardown = TeardownManager::new(
            self.backend,
            self.runner,
            &self.settings.container_bin,
            self.settings.no_teardown,
        )
        .teardown(&context.registry)
        .await;

        match (result, teardown) {
            (Ok(verdict), Ok(summary)) => {
                tracing::info!(run_id = %context.request.run_id, ?verdict, "run finished");
                Ok(RunReport {
                    verdict,
                    publication,
                    teardown: summary,
                })
            }
            (Ok(_), Err(teardown_err)) => Err(RunError::Teardown(teardown_err)),
            (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(teardown_err)) => {
                tracing::error!(error = %teardown_err, "teardown failed after run error");
                Err(err)
            }
        }
    }

    async fn publish(&self, context: &RunContext) -> Option<Publication> {
        let publisher = Publisher::new(self.runner, &self.settings.publish, &context.request.run_id);
        match publisher.publish(&context.bundle).await {
            Ok(publication) => Some(publication),
            Err(err) => {
                tracing::warn!(error = %err, "publishing failed; reporting without a link");
                None
            }
        }
    }

    async fn pipeline(
        &self,
        context: &RunContext,
        reporter: &StatusReporter<'_>,
    ) -> Result<RunVerdict, RunError<B::Error>> {
        let suite = &context.request.suite;
        reporter.pending("Provisioning environment").await;

        let provision_settings = ProvisionSettings {
            run_id: context.request.run_id.clone(),
            template: self.settings.template.clone(),
            container_bin: self.settings.container_bin.clone(),
            reuse_node: self.settings.reuse_node.clone(),
            key_cache_dir: self.settings.key_cache_dir.clone(),
            staging_dir: context.staging_dir.clone(),
        };
        let provisioner = Provisioner::new(
            self.backend,
            self.runner,
            self.factory,
            &context.registry,
            &provision_settings,
        );
        let environment = match provisioner.provision(&suite.topology).await {
            Ok(environment) => environment,
            Err(ProvisionError::User(message)) => {
                tracing::warn!(%message, "provisioning failed for a suite reason");
                return Ok(RunVerdict::UserError(message));
            }
            Err(err) => return Err(RunError::Provision(err)),
        };

        let setup_log = context.bundle.setup_log();
        let preparer = Preparer::new(
            &environment,
            suite,
            &self.settings.workdir,
            &setup_log,
            &context.staging_dir,
        );
        match preparer.prepare(context.request.source.as_deref()).await {
            Ok(()) => {}
            Err(PrepareError::User(message)) => {
                tracing::warn!(%message, "preparation failed for a suite reason");
                return Ok(RunVerdict::UserError(message));
            }
            Err(err) => return Err(RunError::Prepare(err)),
        }

        let mut bindings: Vec<(String, String)> = suite
            .env
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        bindings.extend(environment.exports.iter().cloned());
        let executor = PhaseExecutor::new(
            environment.execution_target.as_ref(),
            &bindings,
            &self.settings.workdir,
        );
        let budget = DeadlineBudget::start(suite.timeout);

        let mut outcome = PhaseOutcome::Success;
        if let Some(options) = &suite.build {
            reporter.pending("Building").await;
            outcome = executor
                .run("build", &build_lines(options), &budget, &context.bundle.build_log())
                .await?;
        }
        if outcome.is_success() {
            reporter.pending("Running tests").await;
            outcome = executor
                .run("test", &suite.tests, &budget, &context.bundle.output_log())
                .await?;
        }

        let collected = collect_artifacts(
            &environment.artifact_sources(),
            environment.mode == ControlMode::ClusterHost,
            &suite.artifacts,
            &self.settings.workdir,
            &context.bundle,
        )
        .await;
        tracing::info!(code = outcome.code(), artifacts = collected, "phases finished");
        Ok(RunVerdict::Completed(outcome))
    }
}
