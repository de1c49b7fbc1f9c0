//! Where downloaded files land.
//!
//! The saved name is derived from the final component of the remote path
//! only, with traversal sequences stripped, and suffixed with the capture
//! time so repeated downloads never overwrite each other.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Used when sanitizing leaves nothing
pub const FALLBACK_NAME: &str = "downloaded_file";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Reduce a remote path to a safe local file name.
pub fn sanitize_filename(remote: &str) -> String {
    // Remote paths may use either separator
    let last = remote
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned = last.replace("..", "").replace(['/', '\\'], "");
    if cleaned.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned
    }
}

/// `name.ext` -> `name_<ts>.ext`, `name` -> `name_<ts>`
pub fn timestamped_name(file_name: &str, at: DateTime<Local>) -> String {
    numbered_name(file_name, at, 0)
}

/// Like [`timestamped_name`], with `_<n>` after the timestamp when `n > 0`
fn numbered_name(file_name: &str, at: DateTime<Local>, n: usize) -> String {
    let ts = at.format(TIMESTAMP_FORMAT);
    let suffix = if n == 0 { String::new() } else { format!("_{n}") };
    match split_extension(file_name) {
        (stem, Some(ext)) => format!("{stem}_{ts}{suffix}.{ext}"),
        (stem, None) => format!("{stem}_{ts}{suffix}"),
    }
}

/// Split on the last dot. Leading dots never start an extension (`.bashrc`
/// has none) and a trailing dot gives an empty one (`name.` -> `name`, ``).
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if !name[..idx].chars().all(|c| c == '.') => {
            (&name[..idx], Some(&name[idx + 1..]))
        }
        _ => (name, None),
    }
}

/// Same-second downloads of one file get `_1`, `_2`, ... up to this many
const MAX_SAME_SECOND: usize = 1000;

/// Downloads directory, created on first save.
#[derive(Debug, Clone)]
pub struct DownloadStore {
    root: PathBuf,
}

impl DownloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path a download of `remote` captured at `at` is written to
    pub fn destination(&self, remote: &str, at: DateTime<Local>) -> PathBuf {
        self.root
            .join(timestamped_name(&sanitize_filename(remote), at))
    }

    /// Persist a completed download. Returns the path written.
    pub async fn save(&self, remote: &str, data: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create {}", self.root.display()))?;

        let at = Local::now();
        let name = sanitize_filename(remote);
        let mut n = 0;
        let (dest, mut file) = loop {
            let dest = self.root.join(numbered_name(&name, at, n));
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&dest)
                .await
            {
                Ok(file) => break (dest, file),
                Err(e) if e.kind() == ErrorKind::AlreadyExists && n < MAX_SAME_SECOND => n += 1,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create {}", dest.display()))
                }
            }
        };

        file.write_all(data)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        file.flush().await?;

        tracing::debug!(remote, path = %dest.display(), bytes = data.len(), "download saved");
        Ok(dest)
    }
}
