//! Cross-node trust for container-controlled clusters.
//!
//! One ed25519 keypair is generated per key cache and reused across runs.
//! The controller receives the keypair and learns every host key; each node
//! receives the keypair and authorises its public half.

use std::ffi::OsString;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;

use crate::transport::{CommandRunner, ExecOptions, RemoteTarget, run_checked};
use crate::util::write_ambient;

use super::ProvisionedNode;

const KEY_FILE_NAME: &str = "id_ed25519";
const KEY_COMMENT: &str = "tidewater-cluster";
const REMOTE_KEY_DIR: &str = "/root/.ssh";
const TRUST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Paths of the cached cluster keypair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterKeypair {
    /// Private key file.
    pub private_key: Utf8PathBuf,
    /// Public key file.
    pub public_key: Utf8PathBuf,
}

impl ClusterKeypair {
    fn in_dir(dir: &Utf8Path) -> Self {
        Self {
            private_key: dir.join(KEY_FILE_NAME),
            public_key: dir.join(format!("{KEY_FILE_NAME}.pub")),
        }
    }
}

/// Returns the keypair under `cache_dir`, generating it on first use.
///
/// # Errors
///
/// Returns a message when the directory cannot be created or `ssh-keygen`
/// fails.
pub async fn ensure_keypair<R: CommandRunner + ?Sized>(
    runner: &R,
    cache_dir: &Utf8Path,
) -> Result<ClusterKeypair, String> {
    let keypair = ClusterKeypair::in_dir(cache_dir);
    if keypair.private_key.exists() && keypair.public_key.exists() {
        return Ok(keypair);
    }
    cap_std::fs_utf8::Dir::create_ambient_dir_all(cache_dir, cap_std::ambient_authority())
        .map_err(|err| format!("cannot create key cache {cache_dir}: {err}"))?;

    tracing::info!(path = %keypair.private_key, "generating cluster keypair");
    let args = [
        OsString::from("-t"),
        OsString::from("ed25519"),
        OsString::from("-N"),
        OsString::new(),
        OsString::from("-q"),
        OsString::from("-C"),
        OsString::from(KEY_COMMENT),
        OsString::from("-f"),
        OsString::from(keypair.private_key.as_str()),
    ];
    run_checked(
        runner,
        "ssh-keygen",
        &args,
        ExecOptions::with_timeout(crate::transport::QUERY_TIMEOUT),
    )
    .await
    .map_err(|err| err.to_string())?;
    Ok(keypair)
}

async fn run_step(target: &dyn RemoteTarget, script: &str) -> Result<(), String> {
    let output = target
        .exec(script, ExecOptions::with_timeout(TRUST_TIMEOUT))
        .await
        .map_err(|err| err.to_string())?;
    if output.is_success() {
        Ok(())
    } else {
        Err(format!(
            "{} exited with {:?}: {}",
            target.name(),
            output.code,
            output.stderr.trim()
        ))
    }
}

async fn install_keypair(target: &dyn RemoteTarget, keypair: &ClusterKeypair) -> Result<(), String> {
    let private = format!("{REMOTE_KEY_DIR}/{KEY_FILE_NAME}");
    let public = format!("{private}.pub");
    run_step(
        target,
        &format!("mkdir -p {REMOTE_KEY_DIR} && chmod 700 {REMOTE_KEY_DIR}"),
    )
    .await?;
    target
        .copy_in(&keypair.private_key, &private)
        .await
        .map_err(|err| err.to_string())?;
    target
        .copy_in(&keypair.public_key, &public)
        .await
        .map_err(|err| err.to_string())?;
    run_step(
        target,
        &format!(
            "chmod 600 {private} && cat {public} >> {REMOTE_KEY_DIR}/authorized_keys && chmod 600 {REMOTE_KEY_DIR}/authorized_keys"
        ),
    )
    .await
}

/// Lets `controller` reach every node over SSH without prompts.
///
/// Each node is added to the controller's known hosts and `/etc/hosts`
/// under its suite name.
///
/// # Errors
///
/// Returns a message naming the first step that failed.
pub async fn bootstrap_trust(
    controller: &dyn RemoteTarget,
    nodes: &[ProvisionedNode],
    keypair: &ClusterKeypair,
    staging_dir: &Utf8Path,
) -> Result<(), String> {
    install_keypair(controller, keypair).await?;

    let mut hosts_entries = String::new();
    for node in nodes {
        hosts_entries.push_str(&format!("{} {}\n", node.node.address, node.node.name));
    }
    let hosts_file = staging_dir.join("cluster-hosts");
    write_ambient(&hosts_file, hosts_entries.as_bytes())?;
    let remote_hosts = String::from("/tmp/tidewater-cluster-hosts");
    controller
        .copy_in(&hosts_file, &remote_hosts)
        .await
        .map_err(|err| err.to_string())?;
    run_step(
        controller,
        &format!("cat {remote_hosts} >> /etc/hosts && rm -f {remote_hosts}"),
    )
    .await?;

    for node in nodes {
        install_keypair(node.target.as_ref(), keypair).await?;
        let address = escape(node.node.address.as_str().into());
        let name = escape(node.node.name.as_str().into());
        run_step(
            controller,
            &format!(
                "ssh-keyscan -p {port} {address} {name} >> {REMOTE_KEY_DIR}/known_hosts 2>/dev/null",
                port = node.node.port
            ),
        )
        .await?;
        tracing::info!(node = %node.node.name, "cluster trust established");
    }
    Ok(())
}
