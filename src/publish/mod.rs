//! Publishing of the upload bundle.
//!
//! Picks the reference a status links to, renders an index page when the
//! bundle holds more than one file and syncs everything to the object store
//! when an upload prefix is configured.

mod index;

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::bundle::{BUILD_LOG, BundleError, INDEX_FILE, OUTPUT_LOG, SETUP_LOG, UploadBundle};
use crate::transport::{CommandRunner, ExecOptions, TransportError, run_checked};
use crate::util::write_ambient;

pub use index::render_index;

/// Content type applied to logs.
pub const LOG_CONTENT_TYPE: &str = "text/plain";

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Logs listed first in the index, in order of preference.
pub const PREFERRED_LOGS: [&str; 3] = [OUTPUT_LOG, BUILD_LOG, SETUP_LOG];

/// Errors raised while publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The bundle could not be read.
    #[error(transparent)]
    Bundle(#[from] BundleError),
    /// The index page could not be written.
    #[error("failed to write index: {0}")]
    Index(String),
    /// The object-store client failed.
    #[error("upload failed: {0}")]
    Upload(#[from] TransportError),
}

/// Where and how to publish.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublishSettings {
    /// Object-store destination; `None` keeps the bundle local.
    pub upload_prefix: Option<String>,
    /// Public URL mirroring `upload_prefix`.
    pub public_url_base: Option<String>,
    /// Object-store client executable.
    pub object_store_bin: String,
}

/// Result of publishing a bundle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Publication {
    /// Bundle-relative name statuses link to.
    pub reference: Utf8PathBuf,
    /// Public URL of `reference`, when one is known.
    pub url: Option<String>,
    /// Whether the bundle was uploaded.
    pub uploaded: bool,
}

/// Picks the file a status links to, or `None` when an index is needed.
///
/// A bundle holding a single file links to it directly.
#[must_use]
pub fn direct_reference(files: &[Utf8PathBuf]) -> Option<Utf8PathBuf> {
    match files {
        [only] => Some(only.clone()),
        _ => None,
    }
}

/// Orders bundle files for the index: preferred logs first, then the rest.
#[must_use]
pub fn index_order(files: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
    let mut ordered: Vec<Utf8PathBuf> = PREFERRED_LOGS
        .iter()
        .filter_map(|log| files.iter().find(|file| file.as_str() == *log).cloned())
        .collect();
    ordered.extend(
        files
            .iter()
            .filter(|file| !PREFERRED_LOGS.contains(&file.as_str()))
            .cloned(),
    );
    ordered
}

/// Publishes bundles through an object-store CLI.
pub struct Publisher<'a, R> {
    runner: &'a R,
    settings: &'a PublishSettings,
    run_id: &'a str,
}

impl<'a, R: CommandRunner> Publisher<'a, R> {
    /// Creates a publisher for run `run_id`.
    #[must_use]
    pub const fn new(runner: &'a R, settings: &'a PublishSettings, run_id: &'a str) -> Self {
        Self {
            runner,
            settings,
            run_id,
        }
    }

    fn destination(&self, prefix: &str) -> String {
        format!("{}/{}", prefix.trim_end_matches('/'), self.run_id)
    }

    /// Public URL of a bundle-relative `name`.
    #[must_use]
    pub fn public_url(&self, name: &str) -> Option<String> {
        self.settings
            .public_url_base
            .as_deref()
            .map(|base| format!("{}/{name}", self.destination(base)))
    }

    /// Chooses the reference, writes the index when needed and uploads.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] when the bundle cannot be read, the index
    /// cannot be written or the upload fails.
    pub async fn publish(&self, bundle: &UploadBundle) -> Result<Publication, PublishError> {
        let files = bundle.files()?;
        let reference = match direct_reference(&files) {
            Some(file) => file,
            None => {
                let html = render_index(self.run_id, &index_order(&files));
                write_ambient(&bundle.root().join(INDEX_FILE), html.as_bytes())
                    .map_err(PublishError::Index)?;
                Utf8PathBuf::from(INDEX_FILE)
            }
        };

        let Some(prefix) = self.settings.upload_prefix.as_deref() else {
            tracing::info!(bundle = %bundle.root(), reference = %reference, "no upload prefix; keeping bundle local");
            return Ok(Publication {
                reference,
                url: None,
                uploaded: false,
            });
        };

        let destination = self.destination(prefix);
        let source = OsString::from(bundle.root().as_str());
        let logs = [
            OsString::from("s3"),
            OsString::from("sync"),
            source.clone(),
            OsString::from(&destination),
            OsString::from("--exclude"),
            OsString::from("*"),
            OsString::from("--include"),
            OsString::from("*.log"),
            OsString::from("--content-type"),
            OsString::from(LOG_CONTENT_TYPE),
        ];
        let rest = [
            OsString::from("s3"),
            OsString::from("sync"),
            source,
            OsString::from(&destination),
            OsString::from("--exclude"),
            OsString::from("*.log"),
        ];
        for args in [&logs[..], &rest[..]] {
            run_checked(
                self.runner,
                &self.settings.object_store_bin,
                args,
                ExecOptions::with_timeout(UPLOAD_TIMEOUT),
            )
            .await?;
        }
        let url = self.public_url(reference.as_str());
        tracing::info!(destination = %destination, url = url.as_deref().unwrap_or(""), "bundle uploaded");
        Ok(Publication {
            reference,
            url,
            uploaded: true,
        })
    }
}
