//! Error types for the Scaleway backend.

use std::fmt;

use crate::backend::{BackendError, InstanceHandle, UserFacing};
use crate::config::ConfigError;
use scaleway_rs::ScalewayError;
use thiserror::Error;

/// Condition a host is polled for after creation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitStage {
    /// The server reaching the `running` state with a public address.
    Running,
    /// The SSH port accepting TCP connections.
    Ssh,
    /// The server disappearing from the API after termination.
    Gone,
}

impl fmt::Display for WaitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "the server to boot",
            Self::Ssh => "SSH to accept connections",
            Self::Gone => "the server to be deleted",
        })
    }
}

/// Errors raised by the Scaleway backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayBackendError {
    /// Cloud credentials or defaults are incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// The instance request lacks a required field.
    #[error("invalid instance request: {0}")]
    Validation(String),
    /// No image matches the suite's distro label.
    #[error("no {arch} image labelled '{label}' in zone {zone}")]
    ImageNotFound {
        /// Distro label from the suite.
        label: String,
        /// Architecture from configuration.
        arch: String,
        /// Zone searched.
        zone: String,
    },
    /// The requested flavor is not offered in the zone.
    #[error("flavor '{instance_type}' is not offered in zone {zone}")]
    InstanceTypeUnavailable {
        /// Commercial type requested.
        instance_type: String,
        /// Zone searched.
        zone: String,
    },
    /// Polling gave up before the host reached `stage`.
    #[error("gave up on host {instance} after {waited_secs}s waiting for {stage}")]
    Timeout {
        /// Condition being polled for.
        stage: WaitStage,
        /// Instance name and provider id.
        instance: String,
        /// Seconds spent polling.
        waited_secs: u64,
    },
    /// The host is running but never got a public address.
    #[error("host {instance} is running without a public IPv4 address")]
    MissingPublicIp {
        /// Instance name and provider id.
        instance: String,
    },
    /// The host is still listed after termination.
    #[error("host {instance} still present after teardown")]
    ResidualResource {
        /// Instance name and provider id.
        instance: String,
    },
    /// The host's state does not allow powering it on.
    #[error("host {instance_id} in state {state} cannot be powered on")]
    PowerOnNotAllowed {
        /// Provider instance identifier.
        instance_id: String,
        /// Current state reported by the provider.
        state: String,
    },
    /// A flexible IP could not be allocated, attached or released.
    #[error("flexible IP {action} failed: {message}")]
    FloatingIp {
        /// Step that failed (`allocate`, `attach`, `detach`, `release`).
        action: String,
        /// Error message from the provider.
        message: String,
    },
    /// The Scaleway API rejected a call.
    #[error("Scaleway API error: {message}")]
    Provider {
        /// Message returned by the SDK.
        message: String,
    },
}

/// `name (id)` label used in wait errors.
pub(super) fn instance_label(handle: &InstanceHandle) -> String {
    format!("{} ({})", handle.name, handle.id)
}

impl UserFacing for ScalewayBackendError {
    fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::ImageNotFound { .. } | Self::InstanceTypeUnavailable { .. } | Self::Validation(_)
        )
    }
}

impl From<ScalewayError> for ScalewayBackendError {
    fn from(value: ScalewayError) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

impl From<BackendError> for ScalewayBackendError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
        }
    }
}

impl From<ConfigError> for ScalewayBackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
