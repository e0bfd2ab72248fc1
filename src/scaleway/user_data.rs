//! Cloud-init user-data helpers for the Scaleway backend.
//!
//! Scaleway exposes instance user-data as a per-server key/value store. When
//! the key is set to `cloud-init`, the value is consumed by cloud-init on the
//! instance's first boot, so it must be written while the server is stopped.

use super::ScalewayBackend;
use super::error::ScalewayBackendError;
use super::lifecycle::{HTTP_CLIENT, SCALEWAY_INSTANCE_API_BASE, provider_error};

/// Reserved user-data key that Scaleway recognises for cloud-init payloads.
pub(crate) const CLOUD_INIT_USER_DATA_KEY: &str = "cloud-init";

pub(crate) fn user_data_url(zone: &str, server_id: &str, key: &str) -> String {
    format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{zone}/servers/{server_id}/user_data/{key}")
}

impl ScalewayBackend {
    pub(in crate::scaleway) async fn set_cloud_init(
        &self,
        zone: &str,
        server_id: &str,
        payload: &str,
    ) -> Result<(), ScalewayBackendError> {
        let response = HTTP_CLIENT
            .patch(user_data_url(zone, server_id, CLOUD_INIT_USER_DATA_KEY))
            .header("X-Auth-Token", &self.config.secret_key)
            .header("Content-Type", "text/plain")
            .body(payload.to_owned())
            .send()
            .await
            .map_err(provider_error)?;
        if response.status().is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ScalewayBackendError::Provider {
            message: format!("failed to set cloud-init user data: {body}"),
        })
    }
}
