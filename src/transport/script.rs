//! Local staging of command scripts.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

use super::TransportError;
use crate::util::write_ambient;

/// A script written locally and destined for a remote path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StagedScript {
    /// Local file to copy.
    pub local: Utf8PathBuf,
    /// Path the script will have on the target.
    pub remote: String,
}

impl StagedScript {
    /// Builds the argv that runs the script, optionally under `timeout`.
    #[must_use]
    pub fn invocation(&self, hard_timeout: Option<Duration>) -> Vec<String> {
        let mut argv = Vec::with_capacity(5);
        if let Some(limit) = hard_timeout {
            argv.push(String::from("timeout"));
            argv.push(String::from("--signal=KILL"));
            argv.push(timeout_secs(limit).to_string());
        }
        argv.push(String::from("sh"));
        argv.push(self.remote.clone());
        argv
    }

    /// Removes the local copy; failures only warn.
    pub fn discard(&self) {
        if let Err(err) = std::fs::remove_file(self.local.as_std_path()) {
            tracing::debug!(path = %self.local, error = %err, "failed to remove staged script");
        }
    }
}

/// Whole seconds for `timeout`, rounded up and at least one.
#[must_use]
pub fn timeout_secs(limit: Duration) -> u64 {
    let whole = limit.as_secs();
    let rounded = if limit.subsec_nanos() > 0 {
        whole.saturating_add(1)
    } else {
        whole
    };
    rounded.max(1)
}

/// Writes scripts into a local staging directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptStager {
    local_dir: Utf8PathBuf,
    remote_dir: String,
}

impl ScriptStager {
    /// Creates a stager writing into `local_dir` for targets that keep
    /// scripts under `remote_dir`.
    #[must_use]
    pub const fn new(local_dir: Utf8PathBuf, remote_dir: String) -> Self {
        Self {
            local_dir,
            remote_dir,
        }
    }

    /// Local staging directory.
    #[must_use]
    pub fn local_dir(&self) -> &Utf8Path {
        &self.local_dir
    }

    /// Writes `body` to a fresh script file.
    ///
    /// The script deletes itself on start so targets do not accumulate
    /// files; `sh` keeps reading from the open descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Stage`] when the file cannot be written.
    pub fn stage(&self, body: &str) -> Result<StagedScript, TransportError> {
        let file_name = format!("tidewater-{}.sh", Uuid::new_v4().simple());
        let local = self.local_dir.join(&file_name);
        let contents = format!("rm -f -- \"$0\"\n{body}\n");
        write_ambient(&local, contents.as_bytes()).map_err(TransportError::Stage)?;
        Ok(StagedScript {
            local,
            remote: format!("{}/{file_name}", self.remote_dir.trim_end_matches('/')),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Duration::from_secs(30), 30)]
    #[case(Duration::from_millis(1500), 2)]
    #[case(Duration::from_millis(10), 1)]
    #[case(Duration::ZERO, 1)]
    fn rounds_timeouts_up(#[case] limit: Duration, #[case] expected: u64) {
        assert_eq!(timeout_secs(limit), expected);
    }

    #[rstest]
    fn staged_script_removes_itself_and_runs_under_timeout() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8");
        let stager = ScriptStager::new(dir, String::from("/tmp/"));
        let staged = stager.stage("echo 'a;b' | wc -c").expect("stage");

        let body = std::fs::read_to_string(staged.local.as_std_path()).expect("read script");
        assert!(body.starts_with("rm -f -- \"$0\"\n"));
        assert!(body.contains("echo 'a;b' | wc -c"));
        assert!(staged.remote.starts_with("/tmp/tidewater-"));
        assert_eq!(
            staged.invocation(Some(Duration::from_secs(5))),
            vec!["timeout", "--signal=KILL", "5", "sh", staged.remote.as_str()]
        );

        staged.discard();
        assert!(!staged.local.exists());
    }
}
