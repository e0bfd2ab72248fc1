//! Instance creation helpers for the Scaleway backend.
//!
//! Instances are created with `stopped: true` so cloud-init user-data and a
//! flexible IP can be attached before the first boot.

use serde::{Deserialize, Serialize};

use crate::backend::InstanceRequest;

use super::super::{ScalewayBackend, ScalewayBackendError};
use super::InstanceSnapshot;

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    commercial_type: &'a str,
    image: &'a str,
    project: &'a str,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: &'a [String],
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: scaleway_rs::ScalewayInstance,
}

impl ScalewayBackend {
    pub(in crate::scaleway) fn is_instance_type_error(
        api_err: &scaleway_rs::ScalewayApiError,
        request: &InstanceRequest,
    ) -> bool {
        matches!(api_err.resource.as_deref(), Some("commercial_type"))
            || api_err
                .resource_id
                .as_deref()
                .is_some_and(|id| id == request.instance_type)
            || (api_err.etype == "invalid_arguments"
                && api_err
                    .message
                    .to_ascii_lowercase()
                    .contains("commercial_type"))
    }

    pub(in crate::scaleway) async fn power_on_if_needed(
        &self,
        zone: &str,
        snapshot: &InstanceSnapshot,
    ) -> Result<(), ScalewayBackendError> {
        if snapshot.state == "running" {
            return Ok(());
        }

        if snapshot.allows("poweron") {
            self.api
                .perform_instance_action_async(zone, &snapshot.id, "poweron")
                .await?;
            return Ok(());
        }

        Err(ScalewayBackendError::PowerOnNotAllowed {
            instance_id: snapshot.id.clone(),
            state: snapshot.state.clone(),
        })
    }

    /// Creates a Scaleway instance in a stopped state.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError`] when the Scaleway API request fails or
    /// the provider rejects the requested instance type.
    pub(in crate::scaleway) async fn create_instance_stopped(
        &self,
        request: &InstanceRequest,
        image_id: &str,
    ) -> Result<InstanceSnapshot, ScalewayBackendError> {
        let payload = CreateServerRequest {
            name: &request.name,
            commercial_type: &request.instance_type,
            image: image_id,
            project: &request.project_id,
            routed_ip_enabled: true,
            dynamic_ip_required: !request.floating_ip,
            tags: &request.tags,
            stopped: true,
            organization: request.organisation_id.as_deref(),
        };

        let path = format!("/zones/{}/servers", request.zone);
        let response = self
            .send_json::<_, CreateServerResponse>(reqwest::Method::POST, &path, Some(&payload))
            .await?;

        match response {
            Ok(created) => Ok(InstanceSnapshot::from(created.server)),
            Err(failure) => {
                if let Ok(api_err) =
                    serde_json::from_slice::<scaleway_rs::ScalewayApiError>(&failure.body)
                    && Self::is_instance_type_error(&api_err, request)
                {
                    return Err(ScalewayBackendError::InstanceTypeUnavailable {
                        instance_type: request.instance_type.clone(),
                        zone: request.zone.clone(),
                    });
                }
                Err(ScalewayBackendError::Provider {
                    message: failure.message,
                })
            }
        }
    }
}
