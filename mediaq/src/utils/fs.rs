//! Filesystem helpers.
//!
//! Errors carry the operation and path so log lines point at the file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Error, Result};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path("creating directory", path, e))
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir_all(parent).await,
        _ => Ok(()),
    }
}

/// Sibling temp path used while `path` is being replaced.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".{}-{}.tmp", std::process::id(), seq));
    path.with_file_name(name)
}

/// Replace `path` with `contents` via write-to-temp-then-rename.
///
/// Readers see either the old or the new file, never a partial one. The temp
/// file is removed if the rename fails.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent_dir(path).await?;

    let tmp = temp_path(path);
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| Error::io_path("writing", &tmp, e))?;

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::io_path("renaming", &tmp, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/state.json");

        write_atomic(&path, b"[1]").await.unwrap();
        write_atomic(&path, b"[1,2]").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"[1,2]");
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_ensure_parent_dir_on_bare_filename() {
        ensure_parent_dir(Path::new("history.json")).await.unwrap();
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let tmp = temp_path(Path::new("/data/history.json"));
        assert_eq!(tmp.parent(), Some(Path::new("/data")));
        assert!(tmp.to_string_lossy().ends_with(".tmp"));
    }
}
