//! Core library for the tidewater CI orchestrator.
//!
//! A run provisions the topology a suite asks for (one cloud host, one
//! container or a cluster of hosts with an optional controller container),
//! prepares it, runs build and test phases under one shared deadline,
//! collects and publishes results, reports commit statuses and tears every
//! resource down again on every exit path.

pub mod artifacts;
pub mod backend;
pub mod bundle;
pub mod cloud_init;
pub mod config;
pub mod janitor;
pub mod phase;
pub mod prepare;
pub mod provision;
pub mod publish;
pub mod run;
pub mod scaleway;
pub mod status;
pub mod suite;
pub mod teardown;
pub mod telemetry;
pub mod test_support;
pub mod transport;
pub mod util;

pub use backend::{
    Backend, InstanceHandle, InstanceNetworking, InstanceRequest, InstanceTemplate, NoCloud,
};
pub use config::{OrchestratorConfig, ScalewayConfig};
pub use janitor::{Janitor, JanitorConfig, JanitorError, SweepSummary};
pub use run::{RunError, RunOrchestrator, RunReport, RunRequest, RunSettings, RunVerdict};
pub use scaleway::{ScalewayBackend, ScalewayBackendError};
pub use suite::{Suite, SuiteError, SuiteRecord};
pub use transport::{CommandOutput, CommandRunner, ProcessCommandRunner, TransportConfig};
