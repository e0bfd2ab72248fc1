//! Commit-status notifier configuration.

use std::ffi::OsString;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::ConfigError;

/// Default GitHub API endpoint.
pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";

/// Settings selecting and configuring the commit-status notifier.
///
/// Without both a token and a repository the run reports to the log only.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TIDEWATER_NOTIFY",
    discovery(
        app_name = "tidewater",
        env_var = "TIDEWATER_CONFIG_PATH",
        config_file_name = "tidewater.toml",
        dotfile_name = ".tidewater.toml",
        project_file_name = "tidewater.toml"
    )
)]
pub struct NotifierConfig {
    /// Token used to authenticate status updates.
    pub github_token: Option<String>,
    /// Repository as `owner/name`.
    pub repo: Option<String>,
    /// API endpoint.
    #[ortho_config(default = DEFAULT_GITHUB_API_BASE.to_owned())]
    pub api_base: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            github_token: None,
            repo: None,
            api_base: String::from(DEFAULT_GITHUB_API_BASE),
        }
    }
}

impl NotifierConfig {
    /// Loads configuration from defaults, files and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("tidewater")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that `repo` looks like `owner/name` when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a malformed repository or a
    /// blank API base.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from(
                "api_base: set TIDEWATER_NOTIFY_API_BASE or add api_base to tidewater.toml",
            )));
        }
        if let Some(repo) = self.repo.as_deref() {
            let valid = repo
                .split_once('/')
                .is_some_and(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'));
            if !valid {
                return Err(ConfigError::InvalidValue {
                    field: String::from("repo"),
                    reason: String::from("expected owner/name"),
                });
            }
        }
        Ok(())
    }

    /// Returns the token and repository when both are configured.
    #[must_use]
    pub fn github(&self) -> Option<(&str, &str)> {
        let token = self.github_token.as_deref().filter(|value| !value.trim().is_empty())?;
        let repo = self.repo.as_deref().filter(|value| !value.trim().is_empty())?;
        Some((token, repo))
    }
}
