//! End-to-end CI runs.
//!
//! A run provisions the suite's topology, prepares it, runs the build and
//! test phases under one deadline, collects artifacts, publishes the bundle
//! and reports a terminal status. Teardown runs on every path out of
//! [`RunOrchestrator::execute`], including internal errors, panics inside
//! the pipeline and termination signals.

mod orchestrator;
mod signal;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::backend::InstanceTemplate;
use crate::bundle::{BundleError, UploadBundle};
use crate::config::ReusedNode;
use crate::phase::{PhaseError, PhaseOutcome};
use crate::prepare::PrepareError;
use crate::provision::ProvisionError;
use crate::publish::{Publication, PublishSettings};
use crate::suite::Suite;
use crate::teardown::{TeardownError, TeardownRegistry, TeardownSummary};

pub use orchestrator::{INTERNAL_ERROR_DESCRIPTION, RunOrchestrator};
pub use signal::shutdown_signal;

/// Errors that end a run abnormally.
///
/// Suite-attributable failures are not errors; they surface as
/// [`RunVerdict::UserError`].
#[derive(Debug, Error)]
pub enum RunError<BackendError>
where
    BackendError: std::error::Error + 'static,
{
    /// Provisioning failed for infrastructure reasons.
    #[error("provisioning failed: {0}")]
    Provision(#[source] ProvisionError<BackendError>),
    /// Preparation failed for infrastructure reasons.
    #[error("preparation failed: {0}")]
    Prepare(#[source] PrepareError),
    /// A phase could not be driven.
    #[error("phase failed: {0}")]
    Phase(#[from] PhaseError),
    /// The bundle directory could not be created.
    #[error(transparent)]
    Bundle(#[from] BundleError),
    /// The run was interrupted by a signal.
    #[error("interrupted by {0}")]
    Interrupted(String),
    /// The pipeline panicked.
    #[error("pipeline panicked: {0}")]
    Panicked(String),
    /// Resources could not be released.
    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

/// How a run ended when nothing unexpected happened.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunVerdict {
    /// The phases ran to this outcome.
    Completed(PhaseOutcome),
    /// The suite is misconfigured; the description was reported.
    UserError(String),
    /// The run did not apply; nothing was provisioned or reported.
    Skipped(String),
}

/// Inputs of one run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunRequest {
    /// Unique run identifier.
    pub run_id: String,
    /// Validated suite.
    pub suite: Suite,
    /// Commit under test.
    pub commit: String,
    /// Branch being tested, `None` for pull requests.
    pub branch: Option<String>,
    /// Local checkout synced to the execution target.
    pub source: Option<Utf8PathBuf>,
    /// Whether the commit is a verified merge of its target branch.
    pub merge_verified: bool,
}

/// Run-wide settings drawn from configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunSettings {
    /// Root for per-run state.
    pub state_dir: Utf8PathBuf,
    /// Cluster keypair cache.
    pub key_cache_dir: Utf8PathBuf,
    /// Provider defaults for hosts.
    pub template: InstanceTemplate,
    /// Container CLI executable.
    pub container_bin: String,
    /// Debug override replacing the single host.
    pub reuse_node: Option<ReusedNode>,
    /// Checkout path on the execution target.
    pub workdir: String,
    /// Publishing destination.
    pub publish: PublishSettings,
    /// Debug override keeping every resource alive.
    pub no_teardown: bool,
}

/// Explicit state of one run, passed to every stage.
#[derive(Clone, Debug)]
pub struct RunContext {
    /// The request being served.
    pub request: RunRequest,
    /// Staging directory published at the end.
    pub bundle: UploadBundle,
    /// Local scratch directory for generated files.
    pub staging_dir: Utf8PathBuf,
    /// Resources awaiting teardown.
    pub registry: TeardownRegistry,
}

impl RunContext {
    /// Creates the per-run directories under `state_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError`] when a directory cannot be created.
    pub fn create(request: RunRequest, state_dir: &Utf8Path) -> Result<Self, BundleError> {
        let run_dir = state_dir.join(&request.run_id);
        let bundle = UploadBundle::create(&run_dir.join("bundle"))?;
        let staging_dir = run_dir.join("staging");
        cap_std::fs_utf8::Dir::create_ambient_dir_all(&staging_dir, cap_std::ambient_authority())
            .map_err(|err| BundleError {
                path: staging_dir.to_string(),
                message: err.to_string(),
            })?;
        Ok(Self {
            request,
            bundle,
            staging_dir,
            registry: TeardownRegistry::new(),
        })
    }
}

/// Everything a finished run reports.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunReport {
    /// How the run ended.
    pub verdict: RunVerdict,
    /// Where results were published.
    pub publication: Option<Publication>,
    /// What teardown released or kept.
    pub teardown: TeardownSummary,
}

#[cfg(test)]
mod tests;
