//! Extra repository file rendering.

use crate::suite::RepoSpec;

/// Name of the repository file installed on targets.
pub const REPO_FILE_NAME: &str = "tidewater-extra.repo";

/// Renders `repos` as one yum repository file.
#[must_use]
pub fn render_repo_file(repos: &[RepoSpec]) -> String {
    repos
        .iter()
        .map(|repo| {
            format!(
                "[{name}]\nname={name}\nbaseurl={baseurl}\ngpgcheck={gpgcheck}\n",
                name = repo.name,
                baseurl = repo.baseurl,
                gpgcheck = u8::from(repo.gpgcheck)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
