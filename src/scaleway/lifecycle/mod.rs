//! Instance lifecycle helpers for the Scaleway backend.

use std::sync::LazyLock;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::ScalewayBackend;
use super::error::ScalewayBackendError;

mod create;
mod floating_ip;
mod image;
mod wait;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub(in crate::scaleway) const SCALEWAY_INSTANCE_API_BASE: &str =
    "https://api.scaleway.com/instance/v1";

pub(in crate::scaleway) static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Server state as observed through the list endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(in crate::scaleway) struct InstanceSnapshot {
    pub(in crate::scaleway) id: String,
    pub(in crate::scaleway) state: String,
    pub(in crate::scaleway) allowed_actions: Vec<String>,
    pub(in crate::scaleway) public_ip: Option<String>,
}

impl InstanceSnapshot {
    pub(in crate::scaleway) fn allows(&self, action: &str) -> bool {
        self.allowed_actions.iter().any(|allowed| allowed == action)
    }
}

impl From<scaleway_rs::ScalewayInstance> for InstanceSnapshot {
    fn from(server: scaleway_rs::ScalewayInstance) -> Self {
        Self {
            id: server.id,
            state: server.state,
            allowed_actions: server.allowed_actions,
            public_ip: server.public_ip.map(|ip| ip.address),
        }
    }
}

pub(in crate::scaleway) fn provider_error(err: impl std::fmt::Display) -> ScalewayBackendError {
    ScalewayBackendError::Provider {
        message: err.to_string(),
    }
}

/// Raw HTTP failure from the Instances API.
pub(in crate::scaleway) struct ApiFailure {
    pub(in crate::scaleway) body: Vec<u8>,
    pub(in crate::scaleway) message: String,
}

impl ScalewayBackend {
    /// Sends a JSON request and decodes a JSON response.
    ///
    /// Non-success statuses come back as [`ApiFailure`] so callers can map
    /// provider error payloads onto specific variants.
    pub(in crate::scaleway) async fn send_json<B, T>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Result<T, ApiFailure>, ScalewayBackendError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{SCALEWAY_INSTANCE_API_BASE}{path}");
        let mut builder = HTTP_CLIENT
            .request(method, &url)
            .header("X-Auth-Token", &self.config.secret_key);
        if let Some(payload) = body {
            builder = builder.json(payload);
        }
        let response = builder.send().await.map_err(provider_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(provider_error)?;

        if status.is_success() {
            let raw: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
            return serde_json::from_slice(raw)
                .map(Ok)
                .map_err(provider_error);
        }
        Ok(Err(ApiFailure {
            message: format!("{status}: {}", String::from_utf8_lossy(&bytes)),
            body: bytes.to_vec(),
        }))
    }
}
