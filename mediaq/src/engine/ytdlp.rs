//! yt-dlp extraction engine.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::info::{DEFAULT_INFO_TTL, InfoCache, MediaInfo, parse_info};
use super::options::{ArgSettings, build_args};
use super::parser::{OutputLine, parse_error, parse_line};
use super::process::{detect_version, remove_partials, tokio_command};
use super::traits::{EngineRequest, ExtractionEngine, ExtractionError, ProgressSink};
use crate::domain::{DownloadRequest, MediaKind};

/// yt-dlp engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YtDlpConfig {
    /// Path to the yt-dlp binary.
    pub binary_path: String,
    /// Path to ffmpeg; looked up on `PATH` when unset.
    pub ffmpeg_path: Option<String>,
    /// Arguments added to every invocation.
    pub extra_args: Vec<String>,
    /// How long fetched media info stays cached, in seconds.
    pub info_ttl_secs: u64,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            binary_path: "yt-dlp".to_string(),
            ffmpeg_path: None,
            extra_args: Vec::new(),
            info_ttl_secs: DEFAULT_INFO_TTL.as_secs(),
        }
    }
}

/// Engine that shells out to yt-dlp.
pub struct YtDlpEngine {
    config: YtDlpConfig,
    /// Cached version string, refreshed after a self-update.
    version: RwLock<Option<String>>,
    ffmpeg_version: Option<String>,
    info_cache: InfoCache,
}

impl YtDlpEngine {
    pub fn new(config: YtDlpConfig) -> Self {
        let version = detect_version(&config.binary_path, "--version");
        let ffmpeg_version =
            detect_version(config.ffmpeg_path.as_deref().unwrap_or("ffmpeg"), "-version");

        match &version {
            Some(v) => info!(version = %v, "yt-dlp detected"),
            None => warn!(path = %config.binary_path, "yt-dlp not found"),
        }
        if ffmpeg_version.is_none() {
            warn!("ffmpeg not found, merging and audio extraction are disabled");
        }

        let info_cache = InfoCache::new(Duration::from_secs(config.info_ttl_secs));
        Self {
            config,
            version: RwLock::new(version),
            ffmpeg_version,
            info_cache,
        }
    }

    /// Whether ffmpeg was found at startup.
    pub fn ffmpeg_available(&self) -> bool {
        self.ffmpeg_version.is_some()
    }

    fn arg_settings(&self) -> ArgSettings {
        ArgSettings {
            ffmpeg_available: self.ffmpeg_available(),
            ffmpeg_location: self.config.ffmpeg_path.clone(),
            extra_args: self.config.extra_args.clone(),
        }
    }

    fn spawn_error(&self, e: std::io::Error) -> ExtractionError {
        match e.kind() {
            std::io::ErrorKind::NotFound => {
                ExtractionError::Unavailable(format!("{}: {}", self.config.binary_path, e))
            }
            _ => ExtractionError::Spawn(e.to_string()),
        }
    }

    /// Run yt-dlp to completion and return its stdout.
    async fn run_to_end(&self, args: &[String]) -> Result<String, ExtractionError> {
        let output = tokio_command(&self.config.binary_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = last_error(&stderr)
                .unwrap_or_else(|| format!("yt-dlp exited with status {}", output.status));
            return Err(ExtractionError::Failed {
                code: output.status.code(),
                message,
            });
        }
        Ok(stdout)
    }
}

/// Arguments for a metadata-only run.
fn info_args(url: &str, proxy: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = ["-J", "--no-warnings", "--no-playlist", "--skip-download"]
        .into_iter()
        .map(String::from)
        .collect();
    if let Some(proxy) = proxy {
        args.extend(["--proxy".to_string(), proxy.to_string()]);
    }
    args.extend(["--".to_string(), url.to_string()]);
    args
}

/// Most specific error message in captured stderr.
fn last_error(stderr: &str) -> Option<String> {
    let mut lines = stderr.lines().map(str::trim).filter(|l| !l.is_empty());
    stderr
        .lines()
        .rev()
        .find_map(parse_error)
        .or_else(|| lines.next_back())
        .map(str::to_string)
}

impl Default for YtDlpEngine {
    fn default() -> Self {
        Self::new(YtDlpConfig::default())
    }
}

#[async_trait]
impl ExtractionEngine for YtDlpEngine {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    fn check_request(&self, request: &DownloadRequest) -> Result<(), String> {
        if request.kind == MediaKind::Audio && !self.ffmpeg_available() {
            return Err("audio extraction requires ffmpeg".to_string());
        }
        Ok(())
    }

    async fn run(
        &self,
        request: EngineRequest,
        sink: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<String, ExtractionError> {
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let args = build_args(&request, &self.arg_settings());
        debug!(job_id = %request.job_id, ?args, "Starting yt-dlp");

        let mut child = tokio_command(&self.config.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractionError::Spawn("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExtractionError::Spawn("failed to capture stderr".to_string()))?;

        // Collect error lines; the last one is the most specific.
        let job_id = request.job_id.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut last_error = None;
            let mut last_line = None;
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(message) = parse_error(&line) {
                    debug!(job_id = %job_id, error = %message, "yt-dlp error");
                    last_error = Some(message.to_string());
                } else if !line.trim().is_empty() {
                    last_line = Some(line);
                }
            }
            last_error.or(last_line)
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut current_file: Option<String> = None;
        let mut final_path: Option<String> = None;
        let mut post_processing = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(job_id = %request.job_id, "yt-dlp cancelled");
                    let _ = child.kill().await;
                    stderr_task.abort();
                    if let Some(file) = &current_file {
                        remove_partials(&PathBuf::from(file)).await;
                    }
                    return Err(ExtractionError::Cancelled);
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => match parse_line(&line) {
                            OutputLine::Progress { progress, filename } => {
                                if filename.is_some() {
                                    current_file = filename;
                                }
                                sink.report(progress);
                            }
                            OutputLine::PostProcess { status, name } => {
                                debug!(job_id = %request.job_id, %status, %name, "Post-processor");
                                if status == "started" && !post_processing {
                                    post_processing = true;
                                    sink.post_processing();
                                }
                            }
                            OutputLine::FinalPath(path) => final_path = Some(path),
                            OutputLine::Other => {}
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!(job_id = %request.job_id, error = %e, "Error reading yt-dlp output");
                            break;
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(ExtractionError::Cancelled);
            }
            status = child.wait() => status?,
        };
        let stderr_message = stderr_task.await.ok().flatten();

        if !status.success() {
            let code = status.code();
            let message = stderr_message
                .unwrap_or_else(|| format!("yt-dlp exited with status {status}"));
            return Err(ExtractionError::Failed { code, message });
        }

        final_path
            .or(current_file)
            .ok_or(ExtractionError::MissingOutput)
    }

    async fn media_info(
        &self,
        url: &str,
        proxy: Option<&str>,
    ) -> Result<Arc<MediaInfo>, ExtractionError> {
        if let Some(info) = self.info_cache.get(url) {
            debug!(url = %url, "Media info cache hit");
            return Ok(info);
        }

        let stdout = self.run_to_end(&info_args(url, proxy)).await?;
        let info = Arc::new(parse_info(&stdout)?);
        self.info_cache.insert(url, info.clone());
        Ok(info)
    }

    async fn self_update(&self) -> Result<Option<String>, ExtractionError> {
        let before = self.version();
        debug!("Checking for yt-dlp updates");
        self.run_to_end(&["-U".to_string()]).await?;

        let binary = self.config.binary_path.clone();
        let after = tokio::task::spawn_blocking(move || detect_version(&binary, "--version"))
            .await
            .map_err(|e| ExtractionError::Spawn(e.to_string()))?;
        *self.version.write() = after.clone();

        if after.is_some() && after != before {
            debug!(from = ?before, to = ?after, "yt-dlp version changed");
            Ok(after)
        } else {
            debug!(version = ?after, "yt-dlp is up to date");
            Ok(None)
        }
    }

    fn is_available(&self) -> bool {
        self.version.read().is_some()
    }

    fn version(&self) -> Option<String> {
        self.version.read().clone()
    }
}
