//! Cloud-init user-data generation.
//!
//! New hosts boot with a `#cloud-config` payload that authorises the
//! provisioning SSH key for the configured user, so the orchestrator can
//! reach the host as soon as `sshd` is listening.

use camino::Utf8Path;
use thiserror::Error;

use crate::util::{expand_tilde, read_to_string_ambient};

/// Errors raised while building cloud-init user-data.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CloudInitError {
    /// Raised when the public key file path is empty or only whitespace.
    #[error("SSH public key file path must not be empty")]
    FilePathEmpty,
    /// Raised when the public key file is empty.
    #[error("SSH public key file `{0}` is empty")]
    FileEmpty(String),
    /// Raised when reading the key file fails.
    #[error("failed to read SSH public key file `{path}`: {message}")]
    FileRead {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Renders a `#cloud-config` document authorising `public_keys` for `user`.
///
/// Returns `None` when there is no key to inject.
#[must_use]
pub fn render_user_data(user: &str, public_keys: &[String]) -> Option<String> {
    let keys: Vec<&str> = public_keys
        .iter()
        .map(|key| key.trim())
        .filter(|key| !key.is_empty())
        .collect();
    if keys.is_empty() {
        return None;
    }

    let mut doc = String::from("#cloud-config\n");
    let key_lines: String = keys.iter().map(|key| format!("  - {key}\n")).collect();
    if user == "root" {
        doc.push_str("disable_root: false\n");
        doc.push_str("ssh_authorized_keys:\n");
        doc.push_str(&key_lines);
    } else {
        doc.push_str("users:\n");
        doc.push_str("  - default\n");
        doc.push_str(&format!("  - name: {user}\n"));
        doc.push_str("    sudo: ALL=(ALL) NOPASSWD:ALL\n");
        doc.push_str("    ssh_authorized_keys:\n");
        for key in keys {
            doc.push_str(&format!("      - {key}\n"));
        }
    }
    Some(doc)
}

/// Loads the public key at `path` (tilde-expanded) and renders user-data for it.
///
/// # Errors
///
/// Returns [`CloudInitError`] when the path is blank, unreadable or the file
/// holds no key.
pub fn user_data_from_key_file(user: &str, path: &str) -> Result<String, CloudInitError> {
    if path.trim().is_empty() {
        return Err(CloudInitError::FilePathEmpty);
    }
    let expanded = expand_tilde(path);
    let key = read_to_string_ambient(Utf8Path::new(&expanded)).map_err(|message| {
        CloudInitError::FileRead {
            path: expanded.clone(),
            message,
        }
    })?;
    render_user_data(user, &[key]).ok_or(CloudInitError::FileEmpty(expanded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn root_user_receives_top_level_keys() {
        let doc = render_user_data("root", &[String::from("ssh-ed25519 AAAA test\n")])
            .expect("payload");
        assert!(doc.starts_with("#cloud-config\n"));
        assert!(doc.contains("disable_root: false"));
        assert!(doc.contains("  - ssh-ed25519 AAAA test\n"));
    }

    #[rstest]
    fn named_user_is_declared() {
        let doc = render_user_data("fedora", &[String::from("ssh-ed25519 AAAA")]).expect("payload");
        assert!(doc.contains("  - name: fedora\n"));
        assert!(doc.contains("      - ssh-ed25519 AAAA\n"));
    }

    #[rstest]
    fn blank_keys_produce_nothing() {
        assert_eq!(render_user_data("root", &[String::from("  \n")]), None);
    }

    #[rstest]
    fn reads_key_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("id.pub");
        std::fs::write(&path, "ssh-ed25519 BBBB user@host\n").expect("write key");
        let doc = user_data_from_key_file("root", path.to_str().expect("utf8")).expect("user data");
        assert!(doc.contains("ssh-ed25519 BBBB user@host"));
    }

    #[rstest]
    #[case("   ", CloudInitError::FilePathEmpty)]
    fn rejects_blank_path(#[case] path: &str, #[case] expected: CloudInitError) {
        assert_eq!(
            user_data_from_key_file("root", path).expect_err("blank path"),
            expected
        );
    }

    #[rstest]
    fn empty_key_file_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("empty.pub");
        std::fs::write(&path, "").expect("write key");
        let err = user_data_from_key_file("root", path.to_str().expect("utf8"))
            .expect_err("empty key");
        assert!(matches!(err, CloudInitError::FileEmpty(_)));
    }
}
