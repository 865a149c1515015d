//! Child process helpers for extraction engines.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::debug;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Create a `tokio::process::Command` that never opens a console window on
/// Windows and is killed if its handle is dropped.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.kill_on_drop(true);
    #[cfg(windows)]
    {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Run `program <flag>` and return the first line of stdout.
///
/// Returns `None` if the binary is missing or exits unsuccessfully.
pub fn detect_version(program: &str, flag: &str) -> Option<String> {
    let mut cmd = std::process::Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.arg(flag)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| {
            String::from_utf8(output.stdout)
                .ok()
                .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
        })
        .filter(|v| !v.is_empty())
}

/// Paths of the partial files yt-dlp leaves next to an interrupted download.
pub fn partial_files(filename: &Path) -> Vec<PathBuf> {
    [".part", ".ytdl"]
        .iter()
        .map(|suffix| {
            let mut name = filename.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        })
        .collect()
}

/// Best-effort removal of partial files. Errors are ignored.
pub async fn remove_partials(filename: &Path) {
    for path in partial_files(filename) {
        if tokio::fs::remove_file(&path).await.is_ok() {
            debug!(path = %path.display(), "Removed partial file");
        }
    }
}
