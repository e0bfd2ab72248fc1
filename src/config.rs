//! Configuration loading via `ortho-config`.

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::InstanceTemplate;
use crate::cloud_init::user_data_from_key_file;
use crate::util::expand_tilde;

/// Default directory holding per-run state and upload bundles.
pub const DEFAULT_STATE_DIR: &str = ".tidewater";

/// Default directory persisting the cluster keypair across runs.
pub const DEFAULT_KEY_CACHE_DIR: &str = "~/.cache/tidewater";

/// Default checkout path on the execution target.
pub const DEFAULT_WORKDIR: &str = "/var/tmp/checkout";

/// Scaleway specific configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: String,
    /// Preferred availability zone. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type used when a host declares no flavor.
    #[ortho_config(default = "DEV1-M".to_owned())]
    pub default_instance_type: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
    /// Public key injected into new hosts through cloud-init.
    pub ssh_public_key_file: Option<String>,
    /// Whether to allocate a flexible IP for every host.
    #[ortho_config(default = false)]
    pub floating_ip: bool,
    /// Prefix for instance names and the common resource tag.
    #[ortho_config(default = "tidewater".to_owned())]
    pub name_prefix: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in tidewater.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("tidewater")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Builds the per-run [`InstanceTemplate`], reading the public key file
    /// when one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails or the key cannot be read.
    pub fn instance_template(&self, ssh_user: &str) -> Result<InstanceTemplate, ConfigError> {
        self.validate()?;
        let user_data = self
            .ssh_public_key_file
            .as_deref()
            .map(|path| user_data_from_key_file(ssh_user, path))
            .transpose()
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        Ok(InstanceTemplate {
            instance_type: self.default_instance_type.trim().to_owned(),
            zone: self.default_zone.trim().to_owned(),
            project_id: self.default_project_id.trim().to_owned(),
            organisation_id: self.default_organization_id.clone(),
            architecture: self.default_architecture.trim().to_owned(),
            name_prefix: self.name_prefix.trim().to_owned(),
            user_data,
            floating_ip: self.floating_ip,
        })
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata::new(
                "Scaleway API secret key",
                "SCW_SECRET_KEY",
                "secret_key",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_project_id,
            &FieldMetadata::new(
                "Scaleway project ID",
                "SCW_DEFAULT_PROJECT_ID",
                "default_project_id",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_instance_type,
            &FieldMetadata::new(
                "instance type",
                "SCW_DEFAULT_INSTANCE_TYPE",
                "default_instance_type",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_zone,
            &FieldMetadata::new(
                "availability zone",
                "SCW_DEFAULT_ZONE",
                "default_zone",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_architecture,
            &FieldMetadata::new(
                "CPU architecture",
                "SCW_DEFAULT_ARCHITECTURE",
                "default_architecture",
                "scaleway",
            ),
        )?;
        require_field(
            &self.name_prefix,
            &FieldMetadata::new("name prefix", "SCW_NAME_PREFIX", "name_prefix", "scaleway"),
        )?;
        Ok(())
    }
}

/// A pre-provisioned node substituted for cloud provisioning.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReusedNode {
    /// Node name.
    pub name: String,
    /// Reachable address.
    pub address: String,
}

/// Run-wide orchestrator settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TIDEWATER",
    discovery(
        app_name = "tidewater",
        env_var = "TIDEWATER_CONFIG_PATH",
        config_file_name = "tidewater.toml",
        dotfile_name = ".tidewater.toml",
        project_file_name = "tidewater.toml"
    )
)]
pub struct OrchestratorConfig {
    /// Root for per-run state and upload bundles.
    #[ortho_config(default = DEFAULT_STATE_DIR.to_owned())]
    pub state_dir: String,
    /// Directory persisting the cluster keypair across runs.
    #[ortho_config(default = DEFAULT_KEY_CACHE_DIR.to_owned())]
    pub key_cache_dir: String,
    /// Object-store destination such as `s3://bucket/prefix`.
    pub upload_prefix: Option<String>,
    /// Public URL mirroring `upload_prefix`.
    pub public_url_base: Option<String>,
    /// Object-store client executable.
    #[ortho_config(default = "aws".to_owned())]
    pub object_store_bin: String,
    /// Debug override substituting a pre-provisioned node, as `name=address`.
    pub reuse_node: Option<String>,
    /// Debug override suppressing all teardown.
    #[ortho_config(default = false)]
    pub no_teardown: bool,
    /// Checkout path on the execution target.
    #[ortho_config(default = DEFAULT_WORKDIR.to_owned())]
    pub workdir: String,
}

impl OrchestratorConfig {
    /// Loads configuration from defaults, files and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("tidewater")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Validates required fields and the debug overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a field is blank or `reuse_node` is
    /// malformed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.state_dir,
            &FieldMetadata::new("state directory", "TIDEWATER_STATE_DIR", "state_dir", "tidewater"),
        )?;
        require_field(
            &self.key_cache_dir,
            &FieldMetadata::new(
                "key cache directory",
                "TIDEWATER_KEY_CACHE_DIR",
                "key_cache_dir",
                "tidewater",
            ),
        )?;
        require_field(
            &self.workdir,
            &FieldMetadata::new("remote workdir", "TIDEWATER_WORKDIR", "workdir", "tidewater"),
        )?;
        if self.upload_prefix.is_some() {
            require_field(
                &self.object_store_bin,
                &FieldMetadata::new(
                    "object store client",
                    "TIDEWATER_OBJECT_STORE_BIN",
                    "object_store_bin",
                    "tidewater",
                ),
            )?;
        }
        self.reused_node()?;
        Ok(())
    }

    /// Parses the `reuse_node` override.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the value is not
    /// `name=address`.
    pub fn reused_node(&self) -> Result<Option<ReusedNode>, ConfigError> {
        let Some(raw) = self.reuse_node.as_deref() else {
            return Ok(None);
        };
        let invalid = || ConfigError::InvalidValue {
            field: String::from("reuse_node"),
            reason: String::from("expected name=address"),
        };
        let (name, address) = raw.split_once('=').ok_or_else(invalid)?;
        let (trimmed_name, trimmed_address) = (name.trim(), address.trim());
        if trimmed_name.is_empty() || trimmed_address.is_empty() {
            return Err(invalid());
        }
        Ok(Some(ReusedNode {
            name: trimmed_name.to_owned(),
            address: trimmed_address.to_owned(),
        }))
    }

    /// Returns the state directory with `~` expanded.
    #[must_use]
    pub fn state_dir_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.state_dir))
    }

    /// Returns the key cache directory with `~` expanded.
    #[must_use]
    pub fn key_cache_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.key_cache_dir))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds a malformed value.
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        /// Offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn scaleway() -> ScalewayConfig {
        ScalewayConfig {
            access_key: None,
            secret_key: String::from("secret"),
            default_organization_id: None,
            default_project_id: String::from("proj"),
            default_zone: String::from("fr-par-1"),
            default_instance_type: String::from("DEV1-M"),
            default_architecture: String::from("x86_64"),
            ssh_public_key_file: None,
            floating_ip: false,
            name_prefix: String::from("tidewater"),
        }
    }

    #[fixture]
    fn orchestrator() -> OrchestratorConfig {
        OrchestratorConfig {
            state_dir: String::from(DEFAULT_STATE_DIR),
            key_cache_dir: String::from("/tmp/keys"),
            upload_prefix: None,
            public_url_base: None,
            object_store_bin: String::from("aws"),
            reuse_node: None,
            no_teardown: false,
            workdir: String::from(DEFAULT_WORKDIR),
        }
    }

    #[rstest]
    fn template_without_key_has_no_user_data(scaleway: ScalewayConfig) {
        let template = scaleway.instance_template("root").expect("template");
        assert_eq!(template.user_data, None);
        assert_eq!(template.name_prefix, "tidewater");
    }

    #[rstest]
    fn missing_secret_is_reported_with_guidance(mut scaleway: ScalewayConfig) {
        scaleway.secret_key = String::from(" ");
        let err = scaleway.validate().expect_err("secret required");
        assert!(err.to_string().contains("SCW_SECRET_KEY"));
    }

    #[rstest]
    #[case("node=10.0.0.5", Some(("node", "10.0.0.5")))]
    #[case(" node = host.example ", Some(("node", "host.example")))]
    fn parses_reuse_node(
        mut orchestrator: OrchestratorConfig,
        #[case] raw: &str,
        #[case] expected: Option<(&str, &str)>,
    ) {
        orchestrator.reuse_node = Some(raw.to_owned());
        let parsed = orchestrator.reused_node().expect("valid override");
        assert_eq!(
            parsed,
            expected.map(|(name, address)| ReusedNode {
                name: name.to_owned(),
                address: address.to_owned(),
            })
        );
    }

    #[rstest]
    #[case("node")]
    #[case("=10.0.0.5")]
    #[case("node=")]
    fn rejects_malformed_reuse_node(mut orchestrator: OrchestratorConfig, #[case] raw: &str) {
        orchestrator.reuse_node = Some(raw.to_owned());
        let err = orchestrator.validate().expect_err("malformed override");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[rstest]
    fn blank_workdir_is_rejected(mut orchestrator: OrchestratorConfig) {
        orchestrator.workdir = String::new();
        assert!(matches!(
            orchestrator.validate(),
            Err(ConfigError::MissingField(_))
        ));
    }
}
