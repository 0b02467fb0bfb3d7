//! Filesystem helpers: atomic replacement and path-safe names.

use crate::error::Result;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Returns `path` with `suffix` appended to its file name.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Replaces `path` with `contents` so readers see either the old or the new file.
///
/// The data goes to `<path>.tmp`, is fsynced, then renamed over `path`.
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = with_suffix(path, ".tmp");
    {
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    sync_dir(path.parent());
    Ok(())
}

/// Best-effort fsync of a directory after a rename.
fn sync_dir(dir: Option<&Path>) {
    #[cfg(unix)]
    if let Some(dir) = dir {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Removes a file, treating an absent file as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Makes a table name safe to use as a single path component.
pub fn sanitize_name(name: &str) -> String {
    if name.is_empty() {
        return "default".to_string();
    }
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    replaced.replace("..", "__")
}
