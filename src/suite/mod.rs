//! Resolved test-suite records.
//!
//! The external configuration loader resolves inheritance and writes one JSON
//! record per suite. This module deserialises such a record, checks that
//! exactly one topology is selected, parses the timeout, and exposes the
//! validated [`Suite`] the rest of the pipeline consumes.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::Utf8Path;
use serde::Deserialize;
use thiserror::Error;

use crate::util::read_to_string_ambient;

mod timeout;

pub use timeout::{DEFAULT_TIMEOUT, MAX_TIMEOUT, parse_timeout};

/// Default `./configure` options used by the build convention.
pub const DEFAULT_CONFIG_OPTS: &str = "--prefix=/usr --libdir=/usr/lib64";

/// Errors raised while loading or validating a suite record.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SuiteError {
    /// Raised when the record file cannot be read.
    #[error("failed to read suite record {path}: {message}")]
    Read {
        /// Path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the record is not valid JSON for the expected schema.
    #[error("failed to parse suite record: {0}")]
    Parse(String),
    /// Raised when zero or several of `host`, `container` and `cluster` are set.
    #[error("exactly one of host, container or cluster must be set (found {found})")]
    Topology {
        /// Number of topology keys present.
        found: usize,
    },
    /// Raised when the timeout string is invalid.
    #[error("invalid timeout '{value}': {reason}")]
    Timeout {
        /// Raw value from the record.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// Raised when the status context contains unsupported characters.
    #[error("invalid context '{0}'")]
    Context(String),
    /// Raised when a cluster declares no hosts.
    #[error("cluster must declare at least one host")]
    EmptyCluster,
    /// Raised when a cluster host lacks a name.
    #[error("cluster host #{index} is missing a name")]
    UnnamedHost {
        /// Zero-based index of the host in the cluster list.
        index: usize,
    },
    /// Raised when two cluster hosts share a name.
    #[error("duplicate cluster host name '{0}'")]
    DuplicateHost(String),
    /// Raised when a required string field is blank.
    #[error("{0} must not be empty")]
    Blank(&'static str),
}

/// OSTree deployment requested for a host.
///
/// With no fields set the host is upgraded to the latest revision of its
/// current ref; otherwise it is rebased onto `remote:branch` and, when a
/// revision is given, pinned to it.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct OstreeSpec {
    /// Remote to rebase from.
    #[serde(default)]
    pub remote: Option<String>,
    /// Branch (ref) to rebase onto.
    #[serde(default)]
    pub branch: Option<String>,
    /// Specific revision to deploy.
    #[serde(default)]
    pub revision: Option<String>,
}

/// A single cloud host.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct HostSpec {
    /// Host name, required inside a cluster.
    #[serde(default)]
    pub name: Option<String>,
    /// Image label passed to the provisioning backend.
    pub distro: String,
    /// Optional flavor override.
    #[serde(default)]
    pub flavor: Option<String>,
    /// Optional OSTree deployment to perform before building.
    #[serde(default)]
    pub ostree: Option<OstreeSpec>,
}

/// A container image to run.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ContainerSpec {
    /// Image reference to pull.
    pub image: String,
}

/// A group of hosts with an optional controller container.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ClusterSpec {
    /// Hosts in declaration order.
    pub hosts: Vec<HostSpec>,
    /// Optional controller container.
    #[serde(default)]
    pub container: Option<ContainerSpec>,
}

/// Validated topology of a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Topology {
    /// One cloud host.
    Host(HostSpec),
    /// One container.
    Container(ContainerSpec),
    /// Several hosts, optionally controlled from a container.
    Cluster(ClusterSpec),
}

/// Extra package repository rendered into a `.repo` file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct RepoSpec {
    /// Repository id.
    pub name: String,
    /// Base URL of the repository.
    pub baseurl: String,
    /// Whether to verify package signatures.
    #[serde(default)]
    pub gpgcheck: bool,
}

/// Options customising the build convention.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct BuildOptions {
    /// Arguments appended to `./configure`.
    #[serde(default)]
    pub config_opts: Option<String>,
    /// Arguments appended to `make all`.
    #[serde(default)]
    pub build_opts: Option<String>,
    /// Arguments appended to `make install`.
    #[serde(default)]
    pub install_opts: Option<String>,
}

/// The `build` key: a toggle or a set of options.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum BuildSetting {
    /// `true` builds with default options, `false` skips the build.
    Toggle(bool),
    /// Build with custom options.
    Options(BuildOptions),
}

impl Default for BuildSetting {
    fn default() -> Self {
        Self::Toggle(true)
    }
}

impl BuildSetting {
    /// Returns the effective options, or `None` when building is disabled.
    #[must_use]
    pub fn options(&self) -> Option<BuildOptions> {
        match self {
            Self::Toggle(true) => Some(BuildOptions::default()),
            Self::Toggle(false) => None,
            Self::Options(options) => Some(options.clone()),
        }
    }
}

/// Raw record as emitted by the configuration loader.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SuiteRecord {
    /// Status context reported to the notifier.
    #[serde(default = "default_context")]
    pub context: String,
    /// Single host topology.
    #[serde(default)]
    pub host: Option<HostSpec>,
    /// Single container topology.
    #[serde(default)]
    pub container: Option<ContainerSpec>,
    /// Cluster topology.
    #[serde(default)]
    pub cluster: Option<ClusterSpec>,
    /// Branches this suite runs on.
    #[serde(default = "default_branches")]
    pub branches: Vec<String>,
    /// Whether the context is required for merging.
    #[serde(default)]
    pub required: bool,
    /// Extra package repositories.
    #[serde(default)]
    pub extra_repos: Vec<RepoSpec>,
    /// Packages to install before building.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Environment bindings injected into every build and test command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Build customisation.
    #[serde(default)]
    pub build: BuildSetting,
    /// Test command lines.
    #[serde(default)]
    pub tests: Vec<String>,
    /// Timeout string (`[0-9]+[smh]`).
    #[serde(default)]
    pub timeout: Option<String>,
    /// Paths to collect after the run.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// Status context used when a record names none, or an unusable one.
pub const DEFAULT_CONTEXT: &str = "default";

fn default_context() -> String {
    String::from(DEFAULT_CONTEXT)
}

fn default_branches() -> Vec<String> {
    vec![String::from("master")]
}

impl SuiteRecord {
    /// Parses a record from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::Parse`] when the JSON does not match the schema.
    pub fn from_json(json: &str) -> Result<Self, SuiteError> {
        serde_json::from_str(json).map_err(|err| SuiteError::Parse(err.to_string()))
    }

    /// Reads and parses a record file.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::Read`] or [`SuiteError::Parse`].
    pub fn from_path(path: &Utf8Path) -> Result<Self, SuiteError> {
        let contents = read_to_string_ambient(path).map_err(|message| SuiteError::Read {
            path: path.to_string(),
            message,
        })?;
        Self::from_json(&contents)
    }

    /// Context to report against, even when the record is otherwise invalid.
    #[must_use]
    pub fn reported_context(&self) -> &str {
        if validate_context(&self.context).is_ok() {
            &self.context
        } else {
            DEFAULT_CONTEXT
        }
    }

    /// Validates the record and produces a [`Suite`].
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError`] describing the first problem found.
    pub fn validate(self) -> Result<Suite, SuiteError> {
        validate_context(&self.context)?;
        let topology = select_topology(self.host, self.container, self.cluster)?;
        let timeout = parse_timeout(self.timeout.as_deref())?;

        Ok(Suite {
            context: self.context,
            topology,
            branches: self.branches,
            required: self.required,
            extra_repos: self.extra_repos,
            packages: self.packages,
            env: self.env,
            build: self.build.options(),
            tests: self.tests,
            timeout,
            artifacts: self.artifacts,
        })
    }
}

/// Validated suite consumed by the orchestrator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Suite {
    /// Status context.
    pub context: String,
    /// Environment topology.
    pub topology: Topology,
    /// Branches this suite runs on.
    pub branches: Vec<String>,
    /// Whether the context is required for merging.
    pub required: bool,
    /// Extra package repositories.
    pub extra_repos: Vec<RepoSpec>,
    /// Packages to install.
    pub packages: Vec<String>,
    /// Environment bindings for build and test commands.
    pub env: BTreeMap<String, String>,
    /// Build options, `None` when building is disabled.
    pub build: Option<BuildOptions>,
    /// Test command lines.
    pub tests: Vec<String>,
    /// Shared build and test budget.
    pub timeout: Duration,
    /// Artifact paths to collect.
    pub artifacts: Vec<String>,
}

impl Suite {
    /// Returns `true` when the suite should run for `branch`.
    ///
    /// Runs without a branch (for example pull requests) always match.
    #[must_use]
    pub fn runs_on_branch(&self, branch: Option<&str>) -> bool {
        branch.is_none_or(|name| self.branches.iter().any(|candidate| candidate == name))
    }
}

fn validate_context(context: &str) -> Result<(), SuiteError> {
    if context.trim().is_empty() {
        return Err(SuiteError::Blank("context"));
    }
    let valid = context
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, ' ' | '.' | '_' | '/' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SuiteError::Context(context.to_owned()))
    }
}

fn select_topology(
    host: Option<HostSpec>,
    container: Option<ContainerSpec>,
    cluster: Option<ClusterSpec>,
) -> Result<Topology, SuiteError> {
    let found = usize::from(host.is_some())
        + usize::from(container.is_some())
        + usize::from(cluster.is_some());
    if found != 1 {
        return Err(SuiteError::Topology { found });
    }

    if let Some(spec) = host {
        validate_host(&spec)?;
        return Ok(Topology::Host(spec));
    }
    if let Some(spec) = container {
        validate_container(&spec)?;
        return Ok(Topology::Container(spec));
    }
    match cluster {
        Some(spec) => {
            validate_cluster(&spec)?;
            Ok(Topology::Cluster(spec))
        }
        None => Err(SuiteError::Topology { found: 0 }),
    }
}

fn validate_host(host: &HostSpec) -> Result<(), SuiteError> {
    if host.distro.trim().is_empty() {
        return Err(SuiteError::Blank("host distro"));
    }
    Ok(())
}

fn validate_container(container: &ContainerSpec) -> Result<(), SuiteError> {
    if container.image.trim().is_empty() {
        return Err(SuiteError::Blank("container image"));
    }
    Ok(())
}

fn validate_cluster(cluster: &ClusterSpec) -> Result<(), SuiteError> {
    if cluster.hosts.is_empty() {
        return Err(SuiteError::EmptyCluster);
    }
    let mut seen = Vec::with_capacity(cluster.hosts.len());
    for (index, host) in cluster.hosts.iter().enumerate() {
        validate_host(host)?;
        let name = host
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(SuiteError::UnnamedHost { index })?;
        if seen.contains(&name) {
            return Err(SuiteError::DuplicateHost(name.to_owned()));
        }
        seen.push(name);
    }
    if let Some(container) = &cluster.container {
        validate_container(container)?;
    }
    Ok(())
}
