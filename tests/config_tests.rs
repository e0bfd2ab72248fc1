//! Configuration loading and validation through the public API.

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::{fixture, rstest};

use tidewater::config::{ConfigError, DEFAULT_WORKDIR};
use tidewater::status::NotifierConfig;
use tidewater::test_support::EnvGuard;
use tidewater::transport::{DEFAULT_KILL_GRACE_SECS, TransportConfig};
use tidewater::{OrchestratorConfig, ScalewayConfig};

#[fixture]
fn scaleway() -> ScalewayConfig {
    ScalewayConfig {
        access_key: Some(String::from("SCWACCESSKEYEXAMPLE")),
        secret_key: String::from("SCWSECRETKEYEXAMPLE"),
        default_organization_id: None,
        default_project_id: String::from("11111111-2222-3333-4444-555555555555"),
        default_zone: String::from("fr-par-1"),
        default_instance_type: String::from("DEV1-M"),
        default_architecture: String::from("x86_64"),
        ssh_public_key_file: None,
        floating_ip: false,
        name_prefix: String::from("tidewater"),
    }
}

type Blank = fn(&mut ScalewayConfig);

#[rstest]
#[case("SCW_SECRET_KEY", "secret_key", |cfg: &mut ScalewayConfig| cfg.secret_key = String::new())]
#[case("SCW_DEFAULT_PROJECT_ID", "default_project_id", |cfg: &mut ScalewayConfig| cfg.default_project_id = String::from("  "))]
#[case("SCW_DEFAULT_INSTANCE_TYPE", "default_instance_type", |cfg: &mut ScalewayConfig| cfg.default_instance_type = String::new())]
#[case("SCW_DEFAULT_ZONE", "default_zone", |cfg: &mut ScalewayConfig| cfg.default_zone = String::new())]
#[case("SCW_DEFAULT_ARCHITECTURE", "default_architecture", |cfg: &mut ScalewayConfig| cfg.default_architecture = String::new())]
#[case("SCW_NAME_PREFIX", "name_prefix", |cfg: &mut ScalewayConfig| cfg.name_prefix = String::new())]
fn missing_fields_produce_actionable_errors(
    mut scaleway: ScalewayConfig,
    #[case] env_var: &str,
    #[case] toml_key: &str,
    #[case] blank: Blank,
) {
    blank(&mut scaleway);
    let err = scaleway.validate().expect_err("field is required");
    let ConfigError::MissingField(message) = err else {
        panic!("expected MissingField, got {err:?}");
    };
    assert!(message.contains(env_var), "should mention {env_var}: {message}");
    assert!(message.contains(toml_key), "should mention {toml_key}: {message}");
    assert!(message.contains("tidewater.toml"), "should mention the file: {message}");
}

#[rstest]
#[tokio::test]
async fn public_key_file_is_read_through_tilde(scaleway: ScalewayConfig) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let home = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 home");
    let fs = Dir::open_ambient_dir(&home, ambient_authority()).expect("open home");
    fs.create_dir_all(".ssh").expect("create .ssh");
    fs.write(".ssh/ci.pub", "ssh-ed25519 AAAATEST ci@tidewater\n")
        .expect("write key");
    let _guard = EnvGuard::set_vars(&[("HOME", home.as_str())]).await;

    let config = ScalewayConfig {
        ssh_public_key_file: Some(String::from("~/.ssh/ci.pub")),
        floating_ip: true,
        ..scaleway
    };
    let template = config.instance_template("root").expect("template");

    let user_data = template.user_data.expect("user data");
    assert!(user_data.starts_with("#cloud-config\n"));
    assert!(user_data.contains("ssh-ed25519 AAAATEST ci@tidewater"));
    assert!(template.floating_ip);
}

#[rstest]
fn unreadable_public_key_is_a_config_error(scaleway: ScalewayConfig) {
    let config = ScalewayConfig {
        ssh_public_key_file: Some(String::from("/nonexistent/tidewater.pub")),
        ..scaleway
    };
    assert!(matches!(
        config.instance_template("root"),
        Err(ConfigError::Parse(_))
    ));
}

#[rstest]
#[tokio::test]
async fn orchestrator_settings_come_from_the_environment() {
    let _guard = EnvGuard::set_vars(&[
        ("TIDEWATER_UPLOAD_PREFIX", "s3://bucket/ci"),
        ("TIDEWATER_REUSE_NODE", "builder=192.0.2.7"),
    ])
    .await;

    let config = OrchestratorConfig::load_without_cli_args().expect("load");
    config.validate().expect("valid");

    assert_eq!(config.upload_prefix.as_deref(), Some("s3://bucket/ci"));
    assert_eq!(config.workdir, DEFAULT_WORKDIR);
    let reused = config.reused_node().expect("parse").expect("override set");
    assert_eq!(reused.name, "builder");
    assert_eq!(reused.address, "192.0.2.7");
}

#[rstest]
#[tokio::test]
async fn transport_defaults_and_overrides() {
    let _guard = EnvGuard::set_vars(&[("TIDEWATER_TRANSPORT_SSH_USER", "fedora")]).await;

    let config = TransportConfig::load_without_cli_args().expect("load");
    config.validate().expect("valid");

    assert_eq!(config.ssh_user, "fedora");
    assert_eq!(config.container_bin, "docker");
    assert_eq!(config.kill_grace_secs, DEFAULT_KILL_GRACE_SECS);
}

#[rstest]
fn notifier_falls_back_to_logging_without_credentials() {
    let config = NotifierConfig {
        repo: Some(String::from("example/project")),
        ..NotifierConfig::default()
    };
    assert!(config.validate().is_ok());
    assert_eq!(config.github(), None);
}
