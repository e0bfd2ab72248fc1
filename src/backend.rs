//! Backend abstraction for provisioning disposable compute instances.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

/// Classifies an error as caused by the suite author or by the system.
///
/// User errors are reported as an `error` status and end the run with a zero
/// exit code. Everything else is an internal error.
pub trait UserFacing {
    /// Returns `true` when the error is attributable to the suite definition.
    fn is_user_error(&self) -> bool;
}

/// Parameters required to create a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRequest {
    /// Human readable label used for the boot image. The backend resolves this
    /// to a provider specific image identifier.
    pub image_label: String,
    /// Commercial type or flavour to request (for example `DEV1-S`).
    pub instance_type: String,
    /// Target availability zone (for example `fr-par-1`).
    pub zone: String,
    /// Project identifier used for billing and ownership.
    pub project_id: String,
    /// Optional organisation identifier when the provider requires one.
    pub organisation_id: Option<String>,
    /// CPU architecture requested for the instance.
    pub architecture: String,
    /// Instance name; the backend appends nothing to it.
    pub name: String,
    /// Cloud-init payload installed before first boot.
    pub user_data: Option<String>,
    /// Tags attached to the instance so sweeps can find it.
    pub tags: Vec<String>,
    /// Whether to attach a dedicated floating IP.
    pub floating_ip: bool,
}

impl InstanceRequest {
    /// Starts a builder for an [`InstanceRequest`].
    #[must_use]
    pub fn builder() -> InstanceRequestBuilder {
        InstanceRequestBuilder::new()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any required string field is
    /// empty.
    pub fn validate(&self) -> Result<(), BackendError> {
        let required = [
            ("image_label", &self.image_label),
            ("instance_type", &self.instance_type),
            ("zone", &self.zone),
            ("project_id", &self.project_id),
            ("architecture", &self.architecture),
            ("name", &self.name),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(BackendError::Validation(field.to_owned()));
            }
        }
        Ok(())
    }
}

/// Builder for [`InstanceRequest`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceRequestBuilder {
    image_label: String,
    instance_type: String,
    zone: String,
    project_id: String,
    organisation_id: Option<String>,
    architecture: String,
    name: String,
    user_data: Option<String>,
    tags: Vec<String>,
    floating_ip: bool,
}

impl InstanceRequestBuilder {
    /// Creates an empty builder; fields must be populated before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image label.
    #[must_use]
    pub fn image_label(mut self, value: impl Into<String>) -> Self {
        self.image_label = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn zone(mut self, value: impl Into<String>) -> Self {
        self.zone = value.into();
        self
    }

    /// Sets the project identifier.
    #[must_use]
    pub fn project_id(mut self, value: impl Into<String>) -> Self {
        self.project_id = value.into();
        self
    }

    /// Sets the optional organisation identifier.
    #[must_use]
    pub fn organisation_id(mut self, value: Option<String>) -> Self {
        self.organisation_id = value;
        self
    }

    /// Sets the architecture.
    #[must_use]
    pub fn architecture(mut self, value: impl Into<String>) -> Self {
        self.architecture = value.into();
        self
    }

    /// Sets the instance name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the cloud-init payload.
    #[must_use]
    pub fn user_data(mut self, value: Option<String>) -> Self {
        self.user_data = value;
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn tag(mut self, value: impl Into<String>) -> Self {
        self.tags.push(value.into());
        self
    }

    /// Requests a floating IP.
    #[must_use]
    pub const fn floating_ip(mut self, value: bool) -> Self {
        self.floating_ip = value;
        self
    }

    /// Builds and validates the [`InstanceRequest`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<InstanceRequest, BackendError> {
        let request = InstanceRequest {
            image_label: self.image_label.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            zone: self.zone.trim().to_owned(),
            project_id: self.project_id.trim().to_owned(),
            organisation_id: self.organisation_id.map(|value| value.trim().to_owned()),
            architecture: self.architecture.trim().to_owned(),
            name: self.name.trim().to_owned(),
            user_data: self.user_data,
            tags: self
                .tags
                .into_iter()
                .map(|tag| tag.trim().to_owned())
                .filter(|tag| !tag.is_empty())
                .collect(),
            floating_ip: self.floating_ip,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Provider defaults shared by every host of a run.
///
/// The per-host parts of a request (image, optional flavor override and name)
/// come from the suite; everything else is fixed for the run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceTemplate {
    /// Default commercial type when a host does not override it.
    pub instance_type: String,
    /// Target availability zone.
    pub zone: String,
    /// Project identifier.
    pub project_id: String,
    /// Optional organisation identifier.
    pub organisation_id: Option<String>,
    /// CPU architecture.
    pub architecture: String,
    /// Prefix for instance names.
    pub name_prefix: String,
    /// Cloud-init payload injected into every host.
    pub user_data: Option<String>,
    /// Whether each host receives a floating IP.
    pub floating_ip: bool,
}

impl InstanceTemplate {
    /// Builds the request for one host of run `run_id`.
    ///
    /// Instances are named `<prefix>-<run_id>-<host>` and tagged with the
    /// prefix and the run tag so the janitor can find them.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when a required field is empty.
    pub fn request_for(
        &self,
        run_id: &str,
        host_name: &str,
        image_label: &str,
        flavor: Option<&str>,
    ) -> Result<InstanceRequest, BackendError> {
        InstanceRequest::builder()
            .image_label(image_label)
            .instance_type(flavor.unwrap_or(&self.instance_type))
            .zone(&self.zone)
            .project_id(&self.project_id)
            .organisation_id(self.organisation_id.clone())
            .architecture(&self.architecture)
            .name(format!("{}-{run_id}-{host_name}", self.name_prefix))
            .user_data(self.user_data.clone())
            .tag(&self.name_prefix)
            .tag(run_tag(run_id))
            .floating_ip(self.floating_ip)
            .build()
    }
}

/// Prefix of the tag attached to every resource of a run.
pub const RUN_TAG_PREFIX: &str = "tidewater-run-";

/// Returns the tag identifying resources of run `run_id`.
#[must_use]
pub fn run_tag(run_id: &str) -> String {
    format!("{RUN_TAG_PREFIX}{run_id}")
}

/// Handle returned by a backend once an instance has been created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider specific identifier for the instance.
    pub id: String,
    /// Name the instance was created with.
    pub name: String,
    /// Zone in which the instance was created.
    pub zone: String,
    /// Identifier of the floating IP attached to the instance, if any.
    pub floating_ip: Option<String>,
}

/// Connection details for reaching an instance once it is ready.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceNetworking {
    /// Public IPv4 address assigned by the provider.
    pub public_ip: IpAddr,
    /// TCP port for SSH (defaults to 22 on Scaleway).
    pub ssh_port: u16,
}

/// Errors raised by backends.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by cloud backends.
pub trait Backend {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + UserFacing + Send + Sync + 'static;

    /// Creates a new instance and returns a handle used for subsequent calls.
    ///
    /// Implementations release anything they allocated when creation fails
    /// part way through.
    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> BackendFuture<'a, InstanceHandle, Self::Error>;

    /// Blocks until the instance is ready for SSH and returns networking info.
    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, InstanceNetworking, Self::Error>;

    /// Destroys the instance and ensures no provider resources remain.
    fn destroy(&self, handle: InstanceHandle) -> BackendFuture<'_, (), Self::Error>;
}

/// Raised when a run asks for a host but no cloud backend was configured.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("no cloud backend configured; cannot provision instance {0}")]
pub struct NoCloudError(pub String);

impl UserFacing for NoCloudError {
    fn is_user_error(&self) -> bool {
        false
    }
}

/// Backend for runs that only use containers.
///
/// Creating or waiting on an instance fails; destroying one is a no-op.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCloud;

impl Backend for NoCloud {
    type Error = NoCloudError;

    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> BackendFuture<'a, InstanceHandle, Self::Error> {
        Box::pin(async move { Err(NoCloudError(request.name.clone())) })
    }

    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, InstanceNetworking, Self::Error> {
        Box::pin(async move { Err(NoCloudError(handle.name.clone())) })
    }

    fn destroy(&self, handle: InstanceHandle) -> BackendFuture<'_, (), Self::Error> {
        Box::pin(async move {
            tracing::debug!(name = %handle.name, "no cloud backend; nothing to destroy");
            Ok(())
        })
    }
}
