//! Local staging directory for one run's logs and artifacts.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use thiserror::Error;

/// Log of the preparation stage.
pub const SETUP_LOG: &str = "setup.log";
/// Log of the build phase.
pub const BUILD_LOG: &str = "build.log";
/// Log of the test phase.
pub const OUTPUT_LOG: &str = "output.log";
/// Directory receiving collected artifacts.
pub const ARTIFACTS_DIR: &str = "artifacts";
/// Generated index page.
pub const INDEX_FILE: &str = "index.html";

/// Errors raised while managing the bundle directory.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("bundle error at {path}: {message}")]
pub struct BundleError {
    /// Path being accessed.
    pub path: String,
    /// Underlying error message.
    pub message: String,
}

impl BundleError {
    fn at(path: &Utf8Path, err: impl std::fmt::Display) -> Self {
        Self {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

/// Staging directory published at the end of a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadBundle {
    root: Utf8PathBuf,
}

impl UploadBundle {
    /// Creates the bundle directory at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError`] when the directory cannot be created.
    pub fn create(root: &Utf8Path) -> Result<Self, BundleError> {
        Dir::create_ambient_dir_all(root, ambient_authority()).map_err(|err| BundleError::at(root, err))?;
        Ok(Self {
            root: root.to_owned(),
        })
    }

    /// Bundle root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Path of `setup.log`.
    #[must_use]
    pub fn setup_log(&self) -> Utf8PathBuf {
        self.root.join(SETUP_LOG)
    }

    /// Path of `build.log`.
    #[must_use]
    pub fn build_log(&self) -> Utf8PathBuf {
        self.root.join(BUILD_LOG)
    }

    /// Path of `output.log`.
    #[must_use]
    pub fn output_log(&self) -> Utf8PathBuf {
        self.root.join(OUTPUT_LOG)
    }

    /// Artifact directory; it only exists once something was collected.
    #[must_use]
    pub fn artifacts_dir(&self) -> Utf8PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    /// Removes empty directories under `artifacts/`, including `artifacts/`
    /// itself when nothing landed in it.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError`] when the tree cannot be read or pruned.
    pub fn prune_artifacts(&self) -> Result<(), BundleError> {
        let dir = Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| BundleError::at(&self.root, err))?;
        if !dir.exists(ARTIFACTS_DIR) {
            return Ok(());
        }
        prune_empty(&dir, ARTIFACTS_DIR, &self.artifacts_dir()).map(|_| ())
    }

    /// Files in the bundle, relative to its root, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError`] when the tree cannot be read.
    pub fn files(&self) -> Result<Vec<Utf8PathBuf>, BundleError> {
        let dir = Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| BundleError::at(&self.root, err))?;
        let mut files = Vec::new();
        walk(&dir, Utf8Path::new(""), &self.root, &mut files)?;
        files.sort();
        Ok(files)
    }
}

/// Removes `name` below `parent` when it holds no files; returns whether it
/// was removed.
fn prune_empty(parent: &Dir, name: &str, path: &Utf8Path) -> Result<bool, BundleError> {
    let dir = parent.open_dir(name).map_err(|err| BundleError::at(path, err))?;
    let mut empty = true;
    for entry in dir.entries().map_err(|err| BundleError::at(path, err))? {
        let item = entry.map_err(|err| BundleError::at(path, err))?;
        let child = item.file_name().map_err(|err| BundleError::at(path, err))?;
        let file_type = item.file_type().map_err(|err| BundleError::at(path, err))?;
        if !file_type.is_dir() || !prune_empty(&dir, &child, &path.join(&child))? {
            empty = false;
        }
    }
    if empty {
        parent.remove_dir(name).map_err(|err| BundleError::at(path, err))?;
    }
    Ok(empty)
}

fn walk(
    dir: &Dir,
    prefix: &Utf8Path,
    root: &Utf8Path,
    files: &mut Vec<Utf8PathBuf>,
) -> Result<(), BundleError> {
    let here = root.join(prefix);
    for entry in dir.entries().map_err(|err| BundleError::at(&here, err))? {
        let item = entry.map_err(|err| BundleError::at(&here, err))?;
        let name = item.file_name().map_err(|err| BundleError::at(&here, err))?;
        let relative = prefix.join(&name);
        let file_type = item.file_type().map_err(|err| BundleError::at(&here, err))?;
        if file_type.is_dir() {
            let child = dir
                .open_dir(&name)
                .map_err(|err| BundleError::at(&root.join(&relative), err))?;
            walk(&child, &relative, root, files)?;
        } else {
            files.push(relative);
        }
    }
    Ok(())
}
