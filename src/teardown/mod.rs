//! Teardown of provisioned resources.
//!
//! Every resource is registered the moment it exists. The registry is drained
//! by [`TeardownManager::teardown`], so each resource is released at most
//! once no matter how many exit paths reach teardown.

use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::backend::{Backend, InstanceHandle};
use crate::transport::{CommandRunner, ExecOptions, QUERY_TIMEOUT, run_checked};

/// A provisioned resource awaiting release.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Resource {
    /// A cloud instance (with its floating IP, if any).
    Instance(InstanceHandle),
    /// A container instance.
    Container {
        /// Name used in logs.
        name: String,
        /// Container identifier.
        id: String,
    },
}

impl Resource {
    /// Returns a short label for logs.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Instance(handle) => &handle.name,
            Self::Container { name, .. } => name,
        }
    }
}

/// Shared list of resources to release, in registration order.
#[derive(Clone, Debug, Default)]
pub struct TeardownRegistry {
    resources: Arc<Mutex<Vec<Resource>>>,
}

impl TeardownRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a resource for release.
    pub fn register(&self, resource: Resource) {
        tracing::debug!(resource = resource.label(), "registered for teardown");
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resource);
    }

    /// Returns the resources currently registered.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn snapshot(&self) -> Vec<Resource> {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns every registered resource.
    #[must_use]
    pub fn drain(&self) -> Vec<Resource> {
        std::mem::take(&mut *self.resources.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Returns `true` when nothing awaits release.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Raised when one or more resources could not be released.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("teardown failed for {}", failures.join("; "))]
pub struct TeardownError {
    /// One message per resource that failed to release.
    pub failures: Vec<String>,
}

/// Outcome of a teardown pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownSummary {
    /// Labels of released resources.
    pub released: Vec<String>,
    /// Labels of resources left running because teardown is suppressed.
    pub kept: Vec<String>,
}

/// Releases resources through the backend and the container CLI.
pub struct TeardownManager<'a, B, R> {
    backend: &'a B,
    runner: &'a R,
    container_bin: &'a str,
    suppressed: bool,
}

impl<'a, B, R> TeardownManager<'a, B, R>
where
    B: Backend + Sync,
    R: CommandRunner,
{
    /// Creates a manager; `suppressed` keeps every resource running.
    #[must_use]
    pub const fn new(backend: &'a B, runner: &'a R, container_bin: &'a str, suppressed: bool) -> Self {
        Self {
            backend,
            runner,
            container_bin,
            suppressed,
        }
    }

    /// Drains `registry` and releases hosts first, then containers.
    ///
    /// Every resource is attempted even when an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError`] listing each resource that failed.
    pub async fn teardown(
        &self,
        registry: &TeardownRegistry,
    ) -> Result<TeardownSummary, TeardownError> {
        let resources = registry.drain();
        let mut summary = TeardownSummary::default();
        if self.suppressed {
            for resource in resources {
                tracing::warn!(resource = resource.label(), "teardown suppressed; leaving resource running");
                summary.kept.push(resource.label().to_owned());
            }
            return Ok(summary);
        }

        let (instances, containers): (Vec<_>, Vec<_>) = resources
            .into_iter()
            .partition(|resource| matches!(resource, Resource::Instance(_)));

        let mut failures = Vec::new();
        for resource in instances.into_iter().chain(containers) {
            let label = resource.label().to_owned();
            match self.release(resource).await {
                Ok(()) => {
                    tracing::info!(resource = %label, "released");
                    summary.released.push(label);
                }
                Err(message) => {
                    tracing::error!(resource = %label, error = %message, "release failed");
                    failures.push(format!("{label}: {message}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(TeardownError { failures })
        }
    }

    async fn release(&self, resource: Resource) -> Result<(), String> {
        match resource {
            Resource::Instance(handle) => {
                if handle.id.is_empty() && handle.floating_ip.is_none() {
                    return Ok(());
                }
                self.backend
                    .destroy(handle)
                    .await
                    .map_err(|err| err.to_string())
            }
            Resource::Container { id, .. } => {
                if id.is_empty() {
                    return Ok(());
                }
                let args = [OsString::from("rm"), OsString::from("-f"), OsString::from(id)];
                run_checked(
                    self.runner,
                    self.container_bin,
                    &args,
                    ExecOptions::with_timeout(QUERY_TIMEOUT),
                )
                .await
                .map(|_| ())
                .map_err(|err| err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests;
