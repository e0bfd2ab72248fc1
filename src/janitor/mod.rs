//! Leak sweeper for runs that died before teardown.
//!
//! Every server and flexible IP of a run is tagged `tidewater-run-<id>` and
//! every container is labelled `tidewater.run=<id>`. The janitor deletes
//! whatever still carries the run's marks through the `scw` and container
//! CLIs, then fails if anything remains.

mod types;

use std::ffi::OsString;
use std::time::Duration;

use thiserror::Error;

use crate::backend::run_tag;
use crate::provision::CONTAINER_RUN_LABEL;
use crate::transport::{CommandOutput, CommandRunner, ExecOptions, TransportError};

use types::TaggedResource;

/// Default Scaleway CLI binary name.
pub const DEFAULT_SCW_BIN: &str = "scw";

/// Default container CLI binary name.
pub const DEFAULT_CONTAINER_BIN: &str = "docker";

const CLI_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const SERVER_PATH: &[&str] = &["instance", "server"];
const IP_PATH: &[&str] = &["instance", "ip"];

/// Configuration for a janitor sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JanitorConfig {
    /// Project id to scope resource discovery.
    pub project_id: String,
    /// Run identifier whose resources are swept.
    pub run_id: String,
    /// Path to the `scw` CLI binary.
    pub scw_bin: String,
    /// Path to the container CLI binary.
    pub container_bin: String,
}

impl JanitorConfig {
    /// Constructs a config, trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError::InvalidConfig`] when any field is blank.
    pub fn new(
        project_id: impl Into<String>,
        run_id: impl Into<String>,
        scw_bin: impl Into<String>,
        container_bin: impl Into<String>,
    ) -> Result<Self, JanitorError> {
        Ok(Self {
            project_id: required("project_id", project_id.into())?,
            run_id: required("run_id", run_id.into())?,
            scw_bin: required("scw_bin", scw_bin.into())?,
            container_bin: required("container_bin", container_bin.into())?,
        })
    }

    /// Tag carried by the run's cloud resources.
    #[must_use]
    pub fn run_tag(&self) -> String {
        run_tag(&self.run_id)
    }

    /// Label filter matching the run's containers.
    #[must_use]
    pub fn container_filter(&self) -> String {
        format!("label={CONTAINER_RUN_LABEL}={}", self.run_id)
    }
}

fn required(field: &str, value: String) -> Result<String, JanitorError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(JanitorError::InvalidConfig {
            field: field.to_owned(),
        });
    }
    Ok(trimmed.to_owned())
}

/// Summary of janitor work.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    /// Servers deleted, with their IPs.
    pub deleted_servers: usize,
    /// Flexible IPs deleted on their own.
    pub deleted_ips: usize,
    /// Containers removed.
    pub deleted_containers: usize,
}

/// Errors returned by the janitor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JanitorError {
    /// Raised when configuration is missing required values.
    #[error("missing {field}")]
    InvalidConfig {
        /// Name of the missing or invalid field.
        field: String,
    },
    /// Raised when a CLI returns a non-zero exit status.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when JSON output from the CLI cannot be parsed.
    #[error("failed to parse {resource} output: {message}")]
    Parse {
        /// Resource type being parsed (for example `servers`).
        resource: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when resources remain after the sweep.
    #[error("resources remain after janitor sweep: {message}")]
    NotClean {
        /// Human-readable description of what remains.
        message: String,
    },
    /// Raised when command execution fails.
    #[error(transparent)]
    Runner(#[from] TransportError),
}

/// Deletes a run's leftover resources by shelling out to CLIs.
#[derive(Clone, Debug)]
pub struct Janitor<R> {
    config: JanitorConfig,
    runner: R,
}

impl<R: CommandRunner> Janitor<R> {
    /// Creates a janitor using the provided configuration and runner.
    #[must_use]
    pub const fn new(config: JanitorConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Deletes servers, then loose IPs, then containers, and verifies that
    /// nothing marked for the run remains.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError`] when a CLI fails, output cannot be parsed or
    /// resources remain afterwards.
    pub async fn sweep(&self) -> Result<SweepSummary, JanitorError> {
        let tag = self.config.run_tag();
        let mut summary = SweepSummary::default();

        for server in self.tagged(SERVER_PATH, "servers", &tag).await? {
            self.delete(SERVER_PATH, &server, &["with-ip=true", "force-shutdown=true"])
                .await?;
            summary.deleted_servers += 1;
        }
        for ip in self.tagged(IP_PATH, "ips", &tag).await? {
            self.delete(IP_PATH, &ip, &[]).await?;
            summary.deleted_ips += 1;
        }
        let containers = self.containers().await?;
        if !containers.is_empty() {
            let mut args = vec![OsString::from("rm"), OsString::from("-f")];
            args.extend(containers.iter().map(OsString::from));
            self.run(&self.config.container_bin, &args, "container rm").await?;
            summary.deleted_containers = containers.len();
        }

        let remaining_servers = self.tagged(SERVER_PATH, "servers", &tag).await?.len();
        let remaining_ips = self.tagged(IP_PATH, "ips", &tag).await?.len();
        let remaining_containers = self.containers().await?.len();
        if remaining_servers + remaining_ips + remaining_containers > 0 {
            return Err(JanitorError::NotClean {
                message: format!(
                    "servers remaining: {remaining_servers}, ips remaining: {remaining_ips}, containers remaining: {remaining_containers}"
                ),
            });
        }
        tracing::info!(run_id = %self.config.run_id, ?summary, "janitor sweep complete");
        Ok(summary)
    }

    async fn run(&self, program: &str, args: &[OsString], resource: &str) -> Result<CommandOutput, JanitorError> {
        let output = self
            .runner
            .run(program, args, ExecOptions::with_timeout(CLI_TIMEOUT))
            .await?;
        if output.is_success() {
            return Ok(output);
        }
        Err(JanitorError::CommandFailure {
            program: program.to_owned(),
            status: output.code,
            status_text: output
                .code
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            stderr: format!("{resource}: {}", output.stderr.trim()),
        })
    }

    async fn tagged(
        &self,
        path: &[&str],
        resource: &str,
        tag: &str,
    ) -> Result<Vec<TaggedResource>, JanitorError> {
        let mut args: Vec<OsString> = path.iter().map(OsString::from).collect();
        args.push(OsString::from("list"));
        args.push(OsString::from(format!("project-id={}", self.config.project_id)));
        args.push(OsString::from("zone=all"));
        args.push(OsString::from("-o"));
        args.push(OsString::from("json"));
        let stdout = self.run(&self.config.scw_bin, &args, resource).await?.stdout;
        let listed: Vec<TaggedResource> =
            serde_json::from_str(&stdout).map_err(|err| JanitorError::Parse {
                resource: resource.to_owned(),
                message: err.to_string(),
            })?;
        Ok(listed
            .into_iter()
            .filter(|item| item.tags.iter().any(|candidate| candidate == tag))
            .collect())
    }

    async fn delete(&self, path: &[&str], item: &TaggedResource, extra: &[&str]) -> Result<(), JanitorError> {
        let mut args: Vec<OsString> = path.iter().map(OsString::from).collect();
        args.push(OsString::from("delete"));
        args.push(OsString::from(&item.id));
        args.push(OsString::from(format!("zone={}", item.zone)));
        args.extend(extra.iter().map(OsString::from));
        self.run(&self.config.scw_bin, &args, "delete")
            .await
            .map(|_| ())
    }

    async fn containers(&self) -> Result<Vec<String>, JanitorError> {
        let args = [
            OsString::from("ps"),
            OsString::from("--all"),
            OsString::from("--quiet"),
            OsString::from("--filter"),
            OsString::from(self.config.container_filter()),
        ];
        let stdout = self
            .run(&self.config.container_bin, &args, "container ps")
            .await?
            .stdout;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }
}

#[cfg(test)]
mod tests;
