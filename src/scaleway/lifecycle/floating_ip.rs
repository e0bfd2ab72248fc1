//! Flexible IP allocation and release.
//!
//! A flexible IP is allocated in the project, tagged like the server it is
//! attached to, and released before that server is deleted.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::backend::InstanceRequest;

use super::super::{ScalewayBackend, ScalewayBackendError};

#[derive(Serialize)]
struct AllocateIpRequest<'a> {
    project: &'a str,
    tags: &'a [String],
    #[serde(rename = "type")]
    ip_type: &'static str,
}

#[derive(Deserialize)]
struct IpEnvelope {
    ip: FlexibleIp,
}

#[derive(Deserialize)]
struct FlexibleIp {
    id: String,
}

fn ip_error(action: &str, message: impl Into<String>) -> ScalewayBackendError {
    ScalewayBackendError::FloatingIp {
        action: action.to_owned(),
        message: message.into(),
    }
}

impl ScalewayBackend {
    /// Allocates a flexible IP for `request` and attaches it to `server_id`.
    ///
    /// Returns the IP identifier. A freshly allocated IP that fails to attach
    /// is released before the error is returned.
    pub(in crate::scaleway) async fn attach_floating_ip(
        &self,
        request: &InstanceRequest,
        server_id: &str,
    ) -> Result<String, ScalewayBackendError> {
        let payload = AllocateIpRequest {
            project: &request.project_id,
            tags: &request.tags,
            ip_type: "routed_ipv4",
        };
        let path = format!("/zones/{}/ips", request.zone);
        let allocated = self
            .send_json::<_, IpEnvelope>(reqwest::Method::POST, &path, Some(&payload))
            .await?
            .map_err(|failure| ip_error("allocate", failure.message))?;
        let ip_id = allocated.ip.id;

        let attach_path = format!("/zones/{}/ips/{ip_id}", request.zone);
        let attached = self
            .send_json::<_, serde_json::Value>(
                reqwest::Method::PATCH,
                &attach_path,
                Some(&json!({ "server": server_id })),
            )
            .await
            .and_then(|result| result.map_err(|failure| ip_error("attach", failure.message)));

        if let Err(err) = attached {
            if let Err(release_err) = self.release_floating_ip(&request.zone, &ip_id).await {
                tracing::warn!(ip = %ip_id, error = %release_err, "failed to release unattached IP");
            }
            return Err(err);
        }
        Ok(ip_id)
    }

    /// Detaches (when still attached) and releases a flexible IP.
    pub(in crate::scaleway) async fn release_floating_ip(
        &self,
        zone: &str,
        ip_id: &str,
    ) -> Result<(), ScalewayBackendError> {
        let path = format!("/zones/{zone}/ips/{ip_id}");
        self.send_json::<_, serde_json::Value>(
            reqwest::Method::PATCH,
            &path,
            Some(&json!({ "server": null })),
        )
        .await?
        .map_err(|failure| ip_error("detach", failure.message))?;

        self.send_json::<(), serde_json::Value>(reqwest::Method::DELETE, &path, None)
            .await?
            .map_err(|failure| ip_error("release", failure.message))?;
        Ok(())
    }
}
