//! Binary entry point for the tidewater CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;

use tidewater::backend::{Backend, InstanceTemplate, NoCloud};
use tidewater::config::{ConfigError, OrchestratorConfig, ScalewayConfig};
use tidewater::publish::{Publication, PublishSettings};
use tidewater::run::{RunOrchestrator, RunReport, RunRequest, RunSettings, RunVerdict};
use tidewater::scaleway::{ScalewayBackend, ScalewayBackendError};
use tidewater::status::{
    GithubNotifier, LogNotifier, Notifier, NotifierConfig, StatusReporter, StatusState,
};
use tidewater::suite::{SuiteError, SuiteRecord, Topology};
use tidewater::telemetry::init_tracing;
use tidewater::transport::{ProcessCommandRunner, TargetFactory, TransportConfig, TransportFactory};

mod cli;

use cli::{Cli, RunCommand};

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid suite: {0}")]
    Suite(#[from] SuiteError),
    #[error("backend error: {0}")]
    Backend(#[from] ScalewayBackendError),
    #[error("run failed: {0}")]
    Run(#[source] BoxedError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "tidewater failed");
            writeln!(io::stderr(), "{err}").ok();
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => {
            init_tracing(command.log_json);
            run_command(command).await
        }
    }
}

fn notifier_for(config: &NotifierConfig, commit: &str) -> Box<dyn Notifier> {
    match config.github() {
        Some((token, repo)) => Box::new(GithubNotifier::new(&config.api_base, repo, commit, token)),
        None => Box::new(LogNotifier),
    }
}

/// Whether `topology` needs cloud credentials to be provisioned.
const fn needs_cloud(topology: &Topology, reusing_node: bool) -> bool {
    match topology {
        Topology::Container(_) => false,
        Topology::Host(_) => !reusing_node,
        Topology::Cluster(_) => true,
    }
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    let record = SuiteRecord::from_path(&Utf8PathBuf::from(&args.suite))?;
    let notifier_config = NotifierConfig::load_without_cli_args()?;
    notifier_config.validate()?;
    let notifier = notifier_for(&notifier_config, &args.commit);

    let context = record.reported_context().to_owned();
    let suite = match record.validate() {
        Ok(suite) => suite,
        Err(err) => {
            tracing::warn!(%context, error = %err, "suite rejected");
            StatusReporter::new(notifier.as_ref(), &context)
                .finish(StatusState::Failure, &format!("Invalid test suite: {err}"), None)
                .await;
            writeln!(io::stdout(), "suite error: {err}").ok();
            return Ok(0);
        }
    };

    let orchestrator_config = OrchestratorConfig::load_without_cli_args()?;
    orchestrator_config.validate()?;
    let transport_config = TransportConfig::load_without_cli_args()?;
    transport_config.validate()?;

    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let state_dir = orchestrator_config.state_dir_path();
    let mut settings = RunSettings {
        key_cache_dir: orchestrator_config.key_cache_path(),
        template: InstanceTemplate::default(),
        container_bin: transport_config.container_bin.clone(),
        reuse_node: orchestrator_config.reused_node()?,
        workdir: orchestrator_config.workdir.clone(),
        publish: PublishSettings {
            upload_prefix: orchestrator_config.upload_prefix.clone(),
            public_url_base: orchestrator_config.public_url_base.clone(),
            object_store_bin: orchestrator_config.object_store_bin.clone(),
        },
        no_teardown: orchestrator_config.no_teardown,
        state_dir: state_dir.clone(),
    };

    let ssh_user = transport_config.ssh_user.clone();
    let runner = Arc::new(ProcessCommandRunner);
    let factory = TransportFactory::new(
        Arc::clone(&runner),
        Arc::new(transport_config),
        state_dir.join(&run_id).join("staging"),
    );

    if let Some(pull_id) = args.pull_id {
        tracing::info!(pull_id, "testing pull request");
    }
    let request = RunRequest {
        run_id,
        suite,
        commit: args.commit,
        branch: args.branch,
        source: args.source.map(Utf8PathBuf::from),
        merge_verified: args.merge_verified,
    };

    let report = if needs_cloud(&request.suite.topology, settings.reuse_node.is_some()) {
        let scaleway_config = ScalewayConfig::load_without_cli_args()?;
        settings.template = scaleway_config.instance_template(&ssh_user)?;
        let backend = ScalewayBackend::new(scaleway_config)?;
        execute(&backend, runner.as_ref(), &factory, notifier.as_ref(), &settings, request).await?
    } else {
        tracing::debug!("no cloud hosts requested; skipping cloud configuration");
        execute(&NoCloud, runner.as_ref(), &factory, notifier.as_ref(), &settings, request).await?
    };
    writeln!(io::stdout(), "{}", summary_line(&report)).ok();
    Ok(0)
}

async fn execute<B>(
    backend: &B,
    runner: &ProcessCommandRunner,
    factory: &dyn TargetFactory,
    notifier: &dyn Notifier,
    settings: &RunSettings,
    request: RunRequest,
) -> Result<RunReport, CliError>
where
    B: Backend + Sync,
{
    RunOrchestrator::new(backend, runner, factory, notifier, settings)
        .execute(request)
        .await
        .map_err(|err| CliError::Run(Box::new(err)))
}

fn summary_line(report: &RunReport) -> String {
    let verdict = match &report.verdict {
        RunVerdict::Completed(outcome) if outcome.is_success() => String::from("passed"),
        RunVerdict::Completed(outcome) => format!("failed (exit code {})", outcome.code()),
        RunVerdict::UserError(message) => format!("suite error: {message}"),
        RunVerdict::Skipped(reason) => format!("skipped: {reason}"),
    };
    match &report.publication {
        Some(publication) => format!("{verdict}; results at {}", link(publication)),
        None => verdict,
    }
}

fn link(publication: &Publication) -> String {
    publication
        .url
        .clone()
        .unwrap_or_else(|| publication.reference.to_string())
}
