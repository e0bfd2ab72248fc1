//! Remote transport configuration.
//!
//! [`TransportConfig`] carries the client executables and SSH options used
//! by both target kinds. It is loaded via `ortho-config`, merging defaults,
//! configuration files and environment variables.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::ConfigError;
use crate::util::expand_tilde;

/// Default scratch directory for staged scripts on targets.
pub const DEFAULT_REMOTE_SCRATCH_DIR: &str = "/tmp";

/// Default local backstop added on top of every hard timeout, in seconds.
pub const DEFAULT_KILL_GRACE_SECS: u64 = 30;

/// SSH, rsync and container client settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TIDEWATER_TRANSPORT",
    discovery(
        app_name = "tidewater",
        env_var = "TIDEWATER_CONFIG_PATH",
        config_file_name = "tidewater.toml",
        dotfile_name = ".tidewater.toml",
        project_file_name = "tidewater.toml"
    )
)]
pub struct TransportConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// Path to the container CLI.
    #[ortho_config(default = "docker".to_owned())]
    pub container_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Private key used for host connections; supports `~/`.
    pub ssh_identity_file: Option<String>,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; disabled for ephemeral hosts.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Scratch directory for staged scripts on targets.
    #[ortho_config(default = DEFAULT_REMOTE_SCRATCH_DIR.to_owned())]
    pub remote_scratch_dir: String,
    /// Seconds added to each hard timeout before the local client is killed.
    #[ortho_config(default = DEFAULT_KILL_GRACE_SECS)]
    pub kill_grace_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            rsync_bin: String::from("rsync"),
            container_bin: String::from("docker"),
            ssh_user: String::from("root"),
            ssh_identity_file: None,
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
            remote_scratch_dir: String::from(DEFAULT_REMOTE_SCRATCH_DIR),
            kill_grace_secs: DEFAULT_KILL_GRACE_SECS,
        }
    }
}

impl TransportConfig {
    /// Loads configuration from defaults, files and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("tidewater")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the first blank field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("ssh_bin", self.ssh_bin.as_str()),
            ("rsync_bin", self.rsync_bin.as_str()),
            ("container_bin", self.container_bin.as_str()),
            ("ssh_user", self.ssh_user.as_str()),
            ("ssh_known_hosts_file", self.ssh_known_hosts_file.as_str()),
            ("remote_scratch_dir", self.remote_scratch_dir.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "{field}: set TIDEWATER_TRANSPORT_{} or add {field} to tidewater.toml",
                    field.to_uppercase()
                )));
            }
        }
        if self
            .ssh_identity_file
            .as_deref()
            .is_some_and(|path| path.trim().is_empty())
        {
            return Err(ConfigError::MissingField(String::from(
                "ssh_identity_file must not be blank when set",
            )));
        }
        Ok(())
    }

    /// Local backstop added on top of every hard timeout.
    #[must_use]
    pub const fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Common SSH options, without the destination.
    #[must_use]
    pub fn ssh_options(&self, port: u16) -> Vec<String> {
        let mut args = vec![String::from("-p"), port.to_string()];
        if let Some(identity) = &self.ssh_identity_file {
            args.push(String::from("-i"));
            args.push(expand_tilde(identity));
        }
        if self.ssh_batch_mode {
            args.push(String::from("-o"));
            args.push(String::from("BatchMode=yes"));
        }
        args.push(String::from("-o"));
        args.push(format!(
            "StrictHostKeyChecking={}",
            if self.ssh_strict_host_key_checking {
                "yes"
            } else {
                "no"
            }
        ));
        args.push(String::from("-o"));
        args.push(format!("UserKnownHostsFile={}", self.ssh_known_hosts_file));
        args.push(String::from("-o"));
        args.push(String::from("LogLevel=ERROR"));
        args
    }
}
