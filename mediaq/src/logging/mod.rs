//! Logging setup with a reloadable filter and optional daily log files.
//!
//! Console output goes to stderr so stdout stays free for the event stream
//! printed by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "mediaq=info";

/// Prefix of the daily log files.
const LOG_FILE_PREFIX: &str = "mediaq.log";

/// Log retention period in days.
const LOG_RETENTION_DAYS: i64 = 7;

/// Timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle to the installed subscriber.
pub struct LoggingHandle {
    filter: FilterHandle,
    log_dir: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    /// Current filter directive.
    pub fn filter(&self) -> String {
        self.filter
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter directive at runtime, e.g. `mediaq=debug`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("invalid filter directive: {e}")))?;
        self.filter
            .reload(filter)
            .map_err(|e| Error::Other(format!("failed to reload filter: {e}")))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Delete log files older than the retention period once a day.
    pub fn start_retention_cleanup(&self, cancel: CancellationToken) {
        let Some(log_dir) = self.log_dir.clone() else {
            return;
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                            warn!(error = %e, "Failed to clean up old logs");
                        }
                    }
                }
            }
        });
    }
}

/// Delete `mediaq.log.YYYY-MM-DD` files older than `retention_days`.
async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days);
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(LOG_FILE_PREFIX))
            .and_then(|n| n.strip_prefix('.'))
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };

        if date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete old log file")
                }
            }
        }
    }

    if deleted > 0 {
        info!(count = deleted, "Cleaned up old log files");
    }
    Ok(deleted)
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides [`DEFAULT_LOG_FILTER`]. When `log_dir` is given, a
/// daily-rolling file layer is added; the returned handle keeps its writer
/// alive and must live as long as the application.
pub fn init_logging(log_dir: Option<&Path>) -> Result<LoggingHandle> {
    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(LocalTimer);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::io_path("creating log directory", dir, e))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to set global subscriber: {e}")))?;

    Ok(LoggingHandle {
        filter: filter_handle,
        log_dir: log_dir.map(Path::to_path_buf),
        _guard: guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_old_dated_logs() {
        let dir = TempDir::new().unwrap();
        let today = Utc::now().date_naive();
        let old = today - chrono::Duration::days(30);

        let old_file = dir.path().join(format!("mediaq.log.{}", old.format("%Y-%m-%d")));
        let new_file = dir.path().join(format!("mediaq.log.{}", today.format("%Y-%m-%d")));
        let other = dir.path().join("notes.txt");
        for path in [&old_file, &new_file, &other] {
            tokio::fs::write(path, b"x").await.unwrap();
        }

        let deleted = cleanup_old_logs(dir.path(), LOG_RETENTION_DAYS).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(!old_file.exists());
        assert!(new_file.exists());
        assert!(other.exists());
    }
}
