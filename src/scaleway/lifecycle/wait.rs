//! Readiness and teardown wait helpers for the Scaleway backend.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};

use crate::backend::{InstanceHandle, InstanceNetworking};

use super::super::error::{WaitStage, instance_label};
use super::super::{ScalewayBackend, ScalewayBackendError};
use super::InstanceSnapshot;

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

impl ScalewayBackend {
    pub(in crate::scaleway) async fn fetch_instance(
        &self,
        handle: &InstanceHandle,
    ) -> Result<Option<InstanceSnapshot>, ScalewayBackendError> {
        let mut servers = self
            .api
            .list_instances(&handle.zone)
            .servers(&handle.id)
            .per_page(1)
            .run_async()
            .await?;

        Ok(servers.pop().map(InstanceSnapshot::from))
    }

    pub(in crate::scaleway) async fn wait_for_public_ip(
        &self,
        handle: &InstanceHandle,
    ) -> Result<InstanceNetworking, ScalewayBackendError> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut saw_running = false;

        while Instant::now() <= deadline {
            let snapshot = self.fetch_instance(handle).await?;
            if let Some(server) = snapshot.filter(|server| server.state == "running") {
                saw_running = true;
                if let Some(networking) = self.networking_for(&server) {
                    return Ok(networking);
                }
            }
            sleep(self.poll_interval).await;
        }

        if saw_running {
            return Err(ScalewayBackendError::MissingPublicIp {
                instance: instance_label(handle),
            });
        }
        Err(self.timed_out(WaitStage::Running, handle))
    }

    pub(in crate::scaleway) fn networking_for(
        &self,
        server: &InstanceSnapshot,
    ) -> Option<InstanceNetworking> {
        server
            .public_ip
            .as_deref()
            .and_then(|ip| IpAddr::from_str(ip).ok())
            .map(|public_ip| InstanceNetworking {
                public_ip,
                ssh_port: self.ssh_port,
            })
    }

    pub(in crate::scaleway) async fn wait_for_ssh_ready(
        &self,
        handle: &InstanceHandle,
        networking: &InstanceNetworking,
    ) -> Result<(), ScalewayBackendError> {
        let deadline = Instant::now() + self.wait_timeout;
        while Instant::now() <= deadline {
            let addr = (networking.public_ip, networking.ssh_port);
            let connect = timeout(SSH_CONNECT_TIMEOUT, TcpStream::connect(addr)).await;
            if matches!(connect, Ok(Ok(_))) {
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }

        Err(self.timed_out(WaitStage::Ssh, handle))
    }

    pub(in crate::scaleway) async fn wait_until_gone(
        &self,
        handle: &InstanceHandle,
    ) -> Result<(), ScalewayBackendError> {
        let deadline = Instant::now() + self.wait_timeout;
        while Instant::now() <= deadline {
            if self.fetch_instance(handle).await?.is_none() {
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }

        tracing::warn!(
            instance = %instance_label(handle),
            stage = %WaitStage::Gone,
            waited_secs = self.wait_timeout.as_secs(),
            "deletion not confirmed"
        );
        Err(ScalewayBackendError::ResidualResource {
            instance: instance_label(handle),
        })
    }

    pub(in crate::scaleway) fn timed_out(
        &self,
        stage: WaitStage,
        handle: &InstanceHandle,
    ) -> ScalewayBackendError {
        ScalewayBackendError::Timeout {
            stage,
            instance: instance_label(handle),
            waited_secs: self.wait_timeout.as_secs(),
        }
    }
}
