//! Extraction engine trait and related types.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::info::MediaInfo;
use crate::domain::{DownloadOptions, DownloadRequest, MediaKind};

/// Everything an engine needs to run one attempt.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// Job ID for tracking.
    pub job_id: String,
    /// Media page URL.
    pub url: String,
    pub kind: MediaKind,
    pub options: DownloadOptions,
    /// Resolved output directory (request override or configured default).
    pub output_dir: PathBuf,
    /// Resolved filename template.
    pub output_template: String,
    /// Resolved proxy (request override or configured default).
    pub proxy: Option<String>,
}

/// Raw progress reported by an engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineProgress {
    /// Bytes transferred so far.
    pub transferred: u64,
    /// Total bytes, when known (exact or estimated).
    pub total: Option<u64>,
    /// Instantaneous rate in bytes/sec.
    pub rate: Option<f64>,
    /// Remaining time in seconds.
    pub eta: Option<u64>,
}

impl EngineProgress {
    /// Percentage in [0, 100], or `None` while the total is unknown.
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => {
                Some((self.transferred as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
            }
            _ => None,
        }
    }
}

/// Signals emitted by engines while running.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineSignal {
    /// Transfer progress update.
    Progress(EngineProgress),
    /// Payload fully transferred, post-processing started.
    PostProcessing,
}

/// Synchronous progress callback handed to engines.
///
/// Reporting never blocks: signals are queued for the worker, which throttles
/// them before anything reaches subscribers.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<EngineSignal>,
}

impl ProgressSink {
    /// Create a sink and the receiver the worker drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink whose signals go nowhere.
    pub fn noop() -> Self {
        Self::channel().0
    }

    /// Report transfer progress.
    pub fn report(&self, progress: EngineProgress) {
        let _ = self.tx.send(EngineSignal::Progress(progress));
    }

    /// Report the start of post-processing. Repeated reports are ignored.
    pub fn post_processing(&self) {
        let _ = self.tx.send(EngineSignal::PostProcessing);
    }
}

/// Errors raised by an extraction attempt.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("failed to start engine: {0}")]
    Spawn(String),

    #[error("{message}")]
    Failed { code: Option<i32>, message: String },

    #[error("stalled: no progress for {}s", .0.as_secs())]
    Stalled(Duration),

    #[error("Download timeout exceeded ({}s)", .0.as_secs())]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("engine finished without reporting an output file")]
    MissingOutput,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            code: None,
            message: message.into(),
        }
    }
}

/// Trait for extraction engines.
#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    /// Engine name used in logs.
    fn name(&self) -> &'static str;

    /// Reject requests this engine cannot serve (e.g. audio without ffmpeg).
    fn check_request(&self, _request: &DownloadRequest) -> Result<(), String> {
        Ok(())
    }

    /// Run one attempt and return the final output path.
    ///
    /// Progress goes through `sink`. When `cancel` fires the engine must stop
    /// promptly, clean up partial output on a best-effort basis and return
    /// [`ExtractionError::Cancelled`].
    async fn run(
        &self,
        request: EngineRequest,
        sink: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<String, ExtractionError>;

    /// Describe `url` without downloading it.
    async fn media_info(
        &self,
        _url: &str,
        _proxy: Option<&str>,
    ) -> Result<Arc<MediaInfo>, ExtractionError> {
        Err(ExtractionError::Unavailable(format!(
            "{} cannot describe media",
            self.name()
        )))
    }

    /// Update the engine in place. Returns the new version if one was
    /// installed, `None` if already current.
    async fn self_update(&self) -> Result<Option<String>, ExtractionError> {
        Err(ExtractionError::Unavailable(format!(
            "{} cannot update itself",
            self.name()
        )))
    }

    /// Check if the engine is available (e.g., binary exists).
    fn is_available(&self) -> bool;

    /// Get the engine version string.
    fn version(&self) -> Option<String>;
}
