//! Commit-status reporting.
//!
//! A run sends `pending` updates as it moves through its stages and exactly
//! one terminal update at the end. [`StatusReporter`] enforces the latter:
//! once a terminal state has gone out, later sends are dropped, so a
//! `success` can never follow a `failure` or `error`.

mod config;
mod github;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use thiserror::Error;

use crate::phase::PhaseOutcome;

pub use config::{DEFAULT_GITHUB_API_BASE, NotifierConfig};
pub use github::GithubNotifier;

/// Longest description the status API accepts.
pub const MAX_DESCRIPTION_CHARS: usize = 140;

/// Commit-status state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    /// Work in progress.
    Pending,
    /// Build and tests passed.
    Success,
    /// Build or tests failed or timed out.
    Failure,
    /// The run could not complete.
    Error,
}

impl StatusState {
    /// Returns `true` for every state except [`StatusState::Pending`].
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Lower-case wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status update for a commit and context.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusReport {
    /// Status context shown next to the commit.
    pub context: String,
    /// State being reported.
    pub state: StatusState,
    /// Human readable description.
    pub description: String,
    /// Link to the published results.
    pub target_url: Option<String>,
}

/// Errors raised while delivering a status update.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NotifyError {
    /// The request could not be sent.
    #[error("status request failed: {0}")]
    Request(String),
    /// The API rejected the update.
    #[error("status API returned {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
}

/// Future returned by [`Notifier::notify`].
pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;

/// Commit-status sink.
pub trait Notifier: Send + Sync {
    /// Delivers one update.
    fn notify<'a>(&'a self, report: &'a StatusReport) -> NotifyFuture<'a>;
}

/// Notifier that only writes updates to the operator log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, report: &'a StatusReport) -> NotifyFuture<'a> {
        Box::pin(async move {
            tracing::info!(
                context = %report.context,
                state = %report.state,
                description = %report.description,
                url = report.target_url.as_deref().unwrap_or(""),
                "status"
            );
            Ok(())
        })
    }
}

/// Truncates `description` to [`MAX_DESCRIPTION_CHARS`] characters.
#[must_use]
pub fn truncate_description(description: &str) -> String {
    description.chars().take(MAX_DESCRIPTION_CHARS).collect()
}

/// Terminal state and description for a completed run.
///
/// Timeouts (`124` and `137`) read differently from ordinary failures; a
/// passing run on a commit that could not be verified as a merge of its
/// target branch carries a caveat.
#[must_use]
pub fn terminal_for(outcome: PhaseOutcome, merge_verified: bool) -> (StatusState, String) {
    match outcome {
        PhaseOutcome::Success if merge_verified => {
            (StatusState::Success, String::from("All tests passed"))
        }
        PhaseOutcome::Success => (
            StatusState::Success,
            String::from("All tests passed, but the commit is not a verified merge of the target branch"),
        ),
        PhaseOutcome::TimedOut | PhaseOutcome::Killed => {
            (StatusState::Failure, String::from("Tests timed out"))
        }
        PhaseOutcome::Failed(code) => (
            StatusState::Failure,
            format!("Tests failed with exit code {code}"),
        ),
    }
}

/// Sends updates for one context and latches after the first terminal one.
pub struct StatusReporter<'a> {
    notifier: &'a dyn Notifier,
    context: String,
    terminal_sent: AtomicBool,
}

impl fmt::Debug for StatusReporter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusReporter")
            .field("context", &self.context)
            .field("terminal_sent", &self.terminal_sent)
            .finish_non_exhaustive()
    }
}

impl<'a> StatusReporter<'a> {
    /// Creates a reporter for `context`.
    #[must_use]
    pub fn new(notifier: &'a dyn Notifier, context: &str) -> Self {
        Self {
            notifier,
            context: context.to_owned(),
            terminal_sent: AtomicBool::new(false),
        }
    }

    /// Returns `true` once a terminal update has been sent.
    fn is_finished(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }

    /// Sends a `pending` update unless the run already finished.
    pub async fn pending(&self, description: &str) {
        if self.is_finished() {
            tracing::debug!(description, "dropping pending status after terminal update");
            return;
        }
        self.send(StatusState::Pending, description, None).await;
    }

    /// Sends the terminal update; later calls are ignored.
    ///
    /// Returns `true` when this call delivered the terminal state.
    pub async fn finish(&self, state: StatusState, description: &str, target_url: Option<&str>) -> bool {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            tracing::debug!(%state, "terminal status already sent");
            return false;
        }
        self.send(state, description, target_url).await;
        true
    }

    async fn send(&self, state: StatusState, description: &str, target_url: Option<&str>) {
        let report = StatusReport {
            context: self.context.clone(),
            state,
            description: truncate_description(description),
            target_url: target_url.map(ToOwned::to_owned),
        };
        match self.notifier.notify(&report).await {
            Ok(()) => tracing::info!(context = %self.context, %state, "status sent"),
            Err(err) => {
                tracing::warn!(context = %self.context, %state, error = %err, "status update failed");
            }
        }
    }
}
