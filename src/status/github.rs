//! GitHub commit-status notifier.

use std::sync::LazyLock;
use std::time::Duration;

use serde::Serialize;

use super::{Notifier, NotifyError, NotifyFuture, StatusReport, StatusState};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("tidewater/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

#[derive(Serialize)]
struct StatusPayload<'a> {
    state: StatusState,
    description: &'a str,
    context: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_url: Option<&'a str>,
}

/// Posts updates to `/repos/<repo>/statuses/<commit>`.
#[derive(Clone, Debug)]
pub struct GithubNotifier {
    api_base: String,
    repo: String,
    commit: String,
    token: String,
}

impl GithubNotifier {
    /// Creates a notifier for `commit` in `repo` (`owner/name`).
    #[must_use]
    pub fn new(api_base: &str, repo: &str, commit: &str, token: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_owned(),
            repo: repo.to_owned(),
            commit: commit.to_owned(),
            token: token.to_owned(),
        }
    }

    /// Endpoint receiving the updates.
    #[must_use]
    pub fn statuses_url(&self) -> String {
        format!("{}/repos/{}/statuses/{}", self.api_base, self.repo, self.commit)
    }
}

impl Notifier for GithubNotifier {
    fn notify<'a>(&'a self, report: &'a StatusReport) -> NotifyFuture<'a> {
        Box::pin(async move {
            let payload = StatusPayload {
                state: report.state,
                description: &report.description,
                context: &report.context,
                target_url: report.target_url.as_deref(),
            };
            let response = HTTP_CLIENT
                .post(self.statuses_url())
                .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                .bearer_auth(&self.token)
                .json(&payload)
                .send()
                .await
                .map_err(|err| NotifyError::Request(err.to_string()))?;
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let body = response.text().await.unwrap_or_default();
            Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            })
        })
    }
}
