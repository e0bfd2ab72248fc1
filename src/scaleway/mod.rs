//! Scaleway backend implementation of the instance lifecycle.

mod error;
mod lifecycle;
mod user_data;

use std::time::Duration;

use crate::backend::{Backend, BackendFuture, InstanceHandle, InstanceNetworking, InstanceRequest};
use crate::config::ScalewayConfig;
use scaleway_rs::ScalewayApi;

const DEFAULT_SSH_PORT: u16 = 22;
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(600);

pub use error::{ScalewayBackendError, WaitStage};

/// Backend that provisions instances through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayBackend {
    api: ScalewayApi,
    config: ScalewayConfig,
    ssh_port: u16,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl ScalewayBackend {
    /// Constructs a new backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Config`] when the provided configuration
    /// fails validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayBackendError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
            ssh_port: DEFAULT_SSH_PORT,
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        })
    }

    async fn create_inner(
        &self,
        request: &InstanceRequest,
        handle: &mut InstanceHandle,
    ) -> Result<(), ScalewayBackendError> {
        let image_id = self.resolve_image_id(request).await?;
        let server = self.create_instance_stopped(request, &image_id).await?;
        handle.id.clone_from(&server.id);
        tracing::debug!(name = %request.name, id = %server.id, "server created");

        if let Some(payload) = &request.user_data {
            self.set_cloud_init(&request.zone, &server.id, payload)
                .await?;
        }
        if request.floating_ip {
            let ip_id = self.attach_floating_ip(request, &server.id).await?;
            handle.floating_ip = Some(ip_id);
        }
        self.power_on_if_needed(&request.zone, &server).await
    }

    async fn destroy_inner(&self, handle: &InstanceHandle) -> Result<(), ScalewayBackendError> {
        if let Some(ip_id) = &handle.floating_ip {
            self.release_floating_ip(&handle.zone, ip_id).await?;
        }
        if handle.id.is_empty() {
            return Ok(());
        }
        match self.fetch_instance(handle).await? {
            None => return Ok(()),
            Some(server) if server.allows("terminate") => {
                self.api
                    .perform_instance_action_async(&handle.zone, &handle.id, "terminate")
                    .await?;
            }
            Some(_) => {
                self.api
                    .delete_instance_async(&handle.zone, &handle.id)
                    .await?;
            }
        }
        self.wait_until_gone(handle).await
    }
}

impl Backend for ScalewayBackend {
    type Error = ScalewayBackendError;

    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> BackendFuture<'a, InstanceHandle, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let mut handle = InstanceHandle {
                id: String::new(),
                name: request.name.clone(),
                zone: request.zone.clone(),
                floating_ip: None,
            };
            if let Err(err) = self.create_inner(request, &mut handle).await {
                if !handle.id.is_empty() || handle.floating_ip.is_some() {
                    if let Err(cleanup) = self.destroy_inner(&handle).await {
                        tracing::warn!(
                            name = %handle.name,
                            error = %cleanup,
                            "cleanup after failed create also failed"
                        );
                    }
                }
                return Err(err);
            }
            Ok(handle)
        })
    }

    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, InstanceNetworking, Self::Error> {
        Box::pin(async move {
            let networking = self.wait_for_public_ip(handle).await?;
            self.wait_for_ssh_ready(handle, &networking).await?;
            Ok(networking)
        })
    }

    fn destroy(&self, handle: InstanceHandle) -> BackendFuture<'_, (), Self::Error> {
        Box::pin(async move { self.destroy_inner(&handle).await })
    }
}
