//! Path helpers shared by configuration and file-handling code.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use tidewater::util::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Splits `path` into the directory to open and the entry inside it.
///
/// Relative paths without a parent resolve against the current directory.
///
/// # Errors
///
/// Returns a message when the path has no final component.
pub fn split_parent(path: &Utf8Path) -> Result<(Utf8PathBuf, String), String> {
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("path has no file name: {path}"))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
        _ => Utf8PathBuf::from("."),
    };
    Ok((parent, file_name.to_owned()))
}

/// Reads a file through a capability handle on its parent directory.
///
/// # Errors
///
/// Returns the underlying I/O error message.
pub fn read_to_string_ambient(path: &Utf8Path) -> Result<String, String> {
    let (parent, file_name) = split_parent(path)?;
    let dir = Dir::open_ambient_dir(&parent, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(&file_name).map_err(|err| err.to_string())
}

/// Writes a file, creating its parent directories first.
///
/// # Errors
///
/// Returns the underlying I/O error message.
pub fn write_ambient(path: &Utf8Path, contents: &[u8]) -> Result<(), String> {
    let (parent, file_name) = split_parent(path)?;
    Dir::create_ambient_dir_all(&parent, ambient_authority()).map_err(|err| err.to_string())?;
    let dir = Dir::open_ambient_dir(&parent, ambient_authority()).map_err(|err| err.to_string())?;
    dir.write(&file_name, contents).map_err(|err| err.to_string())
}
