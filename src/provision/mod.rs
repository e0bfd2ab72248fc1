//! Environment provisioning.
//!
//! Turns a [`Topology`] into reachable targets. Hosts come from the cloud
//! [`Backend`], containers from the container CLI. Every resource is
//! registered with the [`TeardownRegistry`] as soon as it exists, before
//! anything else can fail.

mod trust;

use std::ffi::OsString;
use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use futures::future::join_all;
use thiserror::Error;

use crate::backend::{Backend, InstanceTemplate, UserFacing};
use crate::config::ReusedNode;
use crate::suite::{ClusterSpec, ContainerSpec, HostSpec, Topology};
use crate::teardown::{Resource, TeardownRegistry};
use crate::transport::{
    CommandRunner, ExecOptions, Node, RemoteTarget, TargetFactory, TransportError, run_checked,
};

pub use trust::{ClusterKeypair, bootstrap_trust, ensure_keypair};

/// Label attached to every container of a run.
pub const CONTAINER_RUN_LABEL: &str = "tidewater.run";

/// Name given to the single host of a host topology when the suite omits one.
pub const DEFAULT_HOST_NAME: &str = "host";

/// Name given to a container target.
pub const CONTAINER_NAME: &str = "container";

const SSH_PORT: u16 = 22;
const PULL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// Errors raised while provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError<E>
where
    E: std::error::Error + 'static,
{
    /// Attributable to the suite; reported and the run ends cleanly.
    #[error("{0}")]
    User(String),
    /// Infrastructure failure from the cloud backend.
    #[error("backend error: {0}")]
    Backend(#[source] E),
    /// Failure talking to a target or running a local tool.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Failure establishing cross-node trust.
    #[error("trust bootstrap failed: {0}")]
    Trust(String),
}

impl<E> ProvisionError<E>
where
    E: std::error::Error + UserFacing + 'static,
{
    fn from_backend(host: &str, err: E) -> Self {
        if err.is_user_error() {
            Self::User(format!("failed to provision {host}: {err}"))
        } else {
            Self::Backend(err)
        }
    }
}

/// A provisioned host and the target reaching it.
#[derive(Clone)]
pub struct ProvisionedNode {
    /// Host declaration from the suite.
    pub spec: HostSpec,
    /// Connection details.
    pub node: Node,
    /// Target for commands and copies.
    pub target: Arc<dyn RemoteTarget>,
}

impl fmt::Debug for ProvisionedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionedNode")
            .field("spec", &self.spec)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

/// Who runs the build and test phases.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlMode {
    /// A single host or container.
    Single,
    /// A cluster driven from its first host.
    ClusterHost,
    /// A cluster driven from its controller container.
    ClusterContainer,
}

/// Everything produced by provisioning.
#[derive(Clone)]
pub struct ProvisionedEnvironment {
    /// Hosts in declaration order.
    pub nodes: Vec<ProvisionedNode>,
    /// Container target, for container topologies and controlled clusters.
    pub container: Option<Arc<dyn RemoteTarget>>,
    /// Target for build, test and artifact commands.
    pub execution_target: Arc<dyn RemoteTarget>,
    /// How the environment is controlled.
    pub mode: ControlMode,
    /// `<NAME>_IP` bindings in host order.
    pub exports: Vec<(String, String)>,
}

impl fmt::Debug for ProvisionedEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionedEnvironment")
            .field("nodes", &self.nodes)
            .field("execution_target", &self.execution_target.name())
            .field("mode", &self.mode)
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

impl ProvisionedEnvironment {
    /// Targets artifacts are collected from.
    ///
    /// A host-controlled cluster collects from every host; everything else
    /// from the execution target only.
    #[must_use]
    pub fn artifact_sources(&self) -> Vec<Arc<dyn RemoteTarget>> {
        match self.mode {
            ControlMode::ClusterHost => self.nodes.iter().map(|node| Arc::clone(&node.target)).collect(),
            ControlMode::Single | ControlMode::ClusterContainer => {
                vec![Arc::clone(&self.execution_target)]
            }
        }
    }

    /// Targets that receive extra repositories and packages.
    #[must_use]
    pub fn package_targets(&self) -> Vec<PackageTarget> {
        let from_node = |node: &ProvisionedNode| PackageTarget {
            target: Arc::clone(&node.target),
            ostree: node.spec.ostree.is_some(),
        };
        match (self.mode, self.nodes.first()) {
            (ControlMode::ClusterHost, _) => self.nodes.iter().map(from_node).collect(),
            (ControlMode::Single, Some(node)) => vec![from_node(node)],
            (ControlMode::Single, None) | (ControlMode::ClusterContainer, _) => {
                vec![PackageTarget {
                    target: Arc::clone(&self.execution_target),
                    ostree: false,
                }]
            }
        }
    }
}

/// A target that installs packages, and how.
#[derive(Clone)]
pub struct PackageTarget {
    /// Target receiving the packages.
    pub target: Arc<dyn RemoteTarget>,
    /// Whether packages are layered with `rpm-ostree`.
    pub ostree: bool,
}

impl fmt::Debug for PackageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageTarget")
            .field("target", &self.target.name())
            .field("ostree", &self.ostree)
            .finish()
    }
}

/// Returns the environment variable name exported for host `name`.
///
/// Letters are upper-cased and every other non-identifier character becomes
/// `_`; a leading digit gains a `_` prefix.
#[must_use]
pub fn export_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.starts_with(|ch: char| ch.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    format!("{sanitized}_IP")
}

/// Inputs shared by every provisioning step of a run.
#[derive(Clone, Debug)]
pub struct ProvisionSettings {
    /// Run identifier used in names, tags and labels.
    pub run_id: String,
    /// Provider defaults for hosts.
    pub template: InstanceTemplate,
    /// Container CLI executable.
    pub container_bin: String,
    /// Debug override replacing the single host.
    pub reuse_node: Option<ReusedNode>,
    /// Directory persisting the cluster keypair.
    pub key_cache_dir: Utf8PathBuf,
    /// Local scratch directory for generated files.
    pub staging_dir: Utf8PathBuf,
}

/// Provisions topologies against a backend and a container CLI.
pub struct Provisioner<'a, B, R> {
    backend: &'a B,
    runner: &'a R,
    factory: &'a dyn TargetFactory,
    registry: &'a TeardownRegistry,
    settings: &'a ProvisionSettings,
}

impl<'a, B, R> Provisioner<'a, B, R>
where
    B: Backend + Sync,
    R: CommandRunner,
{
    /// Creates a provisioner.
    #[must_use]
    pub fn new(
        backend: &'a B,
        runner: &'a R,
        factory: &'a dyn TargetFactory,
        registry: &'a TeardownRegistry,
        settings: &'a ProvisionSettings,
    ) -> Self {
        Self {
            backend,
            runner,
            factory,
            registry,
            settings,
        }
    }

    /// Provisions `topology`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::User`] for suite-attributable failures and
    /// other variants for infrastructure failures. Resources created before
    /// the failure stay registered for teardown.
    pub async fn provision(
        &self,
        topology: &Topology,
    ) -> Result<ProvisionedEnvironment, ProvisionError<B::Error>> {
        match topology {
            Topology::Host(spec) => self.single_host(spec).await,
            Topology::Container(spec) => {
                let target = self.start_container(spec).await?;
                Ok(ProvisionedEnvironment {
                    nodes: Vec::new(),
                    container: Some(Arc::clone(&target)),
                    execution_target: target,
                    mode: ControlMode::Single,
                    exports: Vec::new(),
                })
            }
            Topology::Cluster(spec) => self.cluster(spec).await,
        }
    }

    async fn single_host(
        &self,
        spec: &HostSpec,
    ) -> Result<ProvisionedEnvironment, ProvisionError<B::Error>> {
        let name = spec.name.as_deref().unwrap_or(DEFAULT_HOST_NAME);
        let node = match &self.settings.reuse_node {
            Some(reused) => {
                tracing::info!(node = %reused.name, address = %reused.address, "reusing node");
                Node {
                    name: reused.name.clone(),
                    address: reused.address.clone(),
                    port: SSH_PORT,
                }
            }
            None => self.provision_host(name, spec).await?,
        };
        let target = self.factory.host(&node);
        Ok(ProvisionedEnvironment {
            nodes: vec![ProvisionedNode {
                spec: spec.clone(),
                node,
                target: Arc::clone(&target),
            }],
            container: None,
            execution_target: target,
            mode: ControlMode::Single,
            exports: Vec::new(),
        })
    }

    async fn cluster(
        &self,
        spec: &ClusterSpec,
    ) -> Result<ProvisionedEnvironment, ProvisionError<B::Error>> {
        let results = join_all(spec.hosts.iter().map(|host| {
            let name = host.name.as_deref().unwrap_or(DEFAULT_HOST_NAME);
            self.provision_host(name, host)
        }))
        .await;

        let mut nodes = Vec::with_capacity(results.len());
        for (host, result) in spec.hosts.iter().zip(results) {
            let node = result?;
            let target = self.factory.host(&node);
            nodes.push(ProvisionedNode {
                spec: host.clone(),
                node,
                target,
            });
        }

        let exports: Vec<(String, String)> = nodes
            .iter()
            .map(|node| (export_name(&node.node.name), node.node.address.clone()))
            .collect();

        if let Some(container_spec) = &spec.container {
            let controller = self.start_container(container_spec).await?;
            let keypair = ensure_keypair(self.runner, &self.settings.key_cache_dir)
                .await
                .map_err(ProvisionError::Trust)?;
            bootstrap_trust(controller.as_ref(), &nodes, &keypair, &self.settings.staging_dir)
                .await
                .map_err(ProvisionError::Trust)?;
            return Ok(ProvisionedEnvironment {
                nodes,
                container: Some(Arc::clone(&controller)),
                execution_target: controller,
                mode: ControlMode::ClusterContainer,
                exports,
            });
        }

        let Some(first) = nodes.first() else {
            return Err(ProvisionError::User(String::from(
                "cluster must declare at least one host",
            )));
        };
        let execution_target = Arc::clone(&first.target);
        Ok(ProvisionedEnvironment {
            nodes,
            container: None,
            execution_target,
            mode: ControlMode::ClusterHost,
            exports,
        })
    }

    async fn provision_host(
        &self,
        name: &str,
        spec: &HostSpec,
    ) -> Result<Node, ProvisionError<B::Error>> {
        let request = self
            .settings
            .template
            .request_for(
                &self.settings.run_id,
                name,
                &spec.distro,
                spec.flavor.as_deref(),
            )
            .map_err(|err| ProvisionError::User(format!("invalid host {name}: {err}")))?;

        tracing::info!(node = name, distro = %spec.distro, "provisioning host");
        let handle = self
            .backend
            .create(&request)
            .await
            .map_err(|err| ProvisionError::from_backend(name, err))?;
        self.registry.register(Resource::Instance(handle.clone()));

        let networking = self
            .backend
            .wait_for_ready(&handle)
            .await
            .map_err(|err| ProvisionError::from_backend(name, err))?;
        tracing::info!(node = name, address = %networking.public_ip, "host ready");

        Ok(Node {
            name: name.to_owned(),
            address: networking.public_ip.to_string(),
            port: networking.ssh_port,
        })
    }

    async fn start_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<Arc<dyn RemoteTarget>, ProvisionError<B::Error>> {
        let bin = self.settings.container_bin.as_str();
        tracing::info!(image = %spec.image, "pulling image");
        let pull = [OsString::from("pull"), OsString::from(&spec.image)];
        let pulled = self
            .runner
            .run(bin, &pull, ExecOptions::with_timeout(PULL_TIMEOUT))
            .await?;
        if !pulled.is_success() {
            return Err(ProvisionError::User(format!(
                "failed to pull image {}",
                spec.image
            )));
        }

        let run = [
            OsString::from("run"),
            OsString::from("--detach"),
            OsString::from("--label"),
            OsString::from(format!("{CONTAINER_RUN_LABEL}={}", self.settings.run_id)),
            OsString::from("--entrypoint"),
            OsString::from("sleep"),
            OsString::from(&spec.image),
            OsString::from("infinity"),
        ];
        let started = run_checked(
            self.runner,
            bin,
            &run,
            ExecOptions::with_timeout(crate::transport::QUERY_TIMEOUT),
        )
        .await?;
        let id = started.stdout.trim().to_owned();
        if id.is_empty() {
            return Err(ProvisionError::Transport(TransportError::CommandFailure {
                program: bin.to_owned(),
                status: started.code,
                status_text: String::from("0"),
                stderr: String::from("container runtime returned no container id"),
            }));
        }
        self.registry.register(Resource::Container {
            name: String::from(CONTAINER_NAME),
            id: id.clone(),
        });
        tracing::info!(container = %id, image = %spec.image, "container started");
        Ok(self.factory.container(CONTAINER_NAME, &id))
    }
}

#[cfg(test)]
mod tests;
