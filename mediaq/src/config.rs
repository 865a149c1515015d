//! Application configuration.
//!
//! Built once at startup from the environment (after loading `.env`) and
//! passed to the orchestrator; it is never mutated afterwards.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broadcast::DEFAULT_SUBSCRIBER_BUFFER;
use crate::domain::request::MAX_RETRIES_LIMIT;
use crate::engine::YtDlpConfig;
use crate::engine::info::DEFAULT_INFO_TTL;
use crate::retry::RetryConfig;
use crate::{Error, Result};

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_output_template() -> String {
    "%(title)s.%(ext)s".to_string()
}

fn default_history_file() -> PathBuf {
    PathBuf::from("./download_history.json")
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default output directory.
    pub download_dir: PathBuf,
    /// Default filename template, relative to the output directory.
    pub output_template: String,
    /// Number of concurrency tickets.
    pub max_concurrent_downloads: usize,
    /// Default proxy for every job.
    pub proxy: Option<String>,
    pub history_file: PathBuf,
    /// Terminal jobs kept in history before the oldest are pruned.
    pub max_history_size: usize,
    #[serde(with = "duration_ms")]
    pub history_save_interval: Duration,
    #[serde(with = "duration_ms")]
    pub scheduler_interval: Duration,
    #[serde(with = "duration_ms")]
    pub progress_throttle: Duration,
    pub retry: RetryConfig,
    /// Default for requests that do not set `auto_retry`.
    pub auto_retry: bool,
    /// Abort an attempt after this long without progress.
    #[serde(with = "option_duration_ms")]
    pub stall_timeout: Option<Duration>,
    /// Abort an attempt that runs longer than this, post-processing included.
    #[serde(with = "option_duration_ms")]
    pub download_timeout: Option<Duration>,
    /// Per-subscriber event buffer.
    pub subscriber_buffer: usize,
    /// How long shutdown waits for workers to stop.
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
    pub ytdlp_path: String,
    pub ffmpeg_path: Option<String>,
    /// Extra yt-dlp arguments for every job.
    pub extra_ytdlp_args: Vec<String>,
    /// How long media info lookups stay cached.
    #[serde(with = "duration_ms")]
    pub info_cache_ttl: Duration,
    /// Periodically run `yt-dlp -U`.
    pub ytdlp_auto_update: bool,
    #[serde(with = "duration_ms")]
    pub ytdlp_update_interval: Duration,
    /// Directory for daily log files; console only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            output_template: default_output_template(),
            max_concurrent_downloads: 3,
            proxy: None,
            history_file: default_history_file(),
            max_history_size: 1000,
            history_save_interval: Duration::from_secs(30),
            scheduler_interval: Duration::from_secs(1),
            progress_throttle: Duration::from_millis(250),
            retry: RetryConfig::default(),
            auto_retry: true,
            stall_timeout: None,
            download_timeout: Some(Duration::from_secs(3600)),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            shutdown_timeout: Duration::from_secs(10),
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: None,
            extra_ytdlp_args: Vec::new(),
            info_cache_ttl: DEFAULT_INFO_TTL,
            ytdlp_auto_update: false,
            ytdlp_update_interval: Duration::from_secs(86400),
            log_dir: None,
        }
    }
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unset or empty keys keep their defaults; malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(dir) = get("DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(template) = get("OUTPUT_TEMPLATE") {
            config.output_template = template;
        }
        if let Some(n) = get("MAX_CONCURRENT_DOWNLOADS") {
            config.max_concurrent_downloads = parse("MAX_CONCURRENT_DOWNLOADS", &n)?;
        }
        config.proxy = get("PROXY");
        if let Some(path) = get("HISTORY_FILE") {
            config.history_file = PathBuf::from(path);
        }
        if let Some(n) = get("MAX_HISTORY_SIZE") {
            config.max_history_size = parse("MAX_HISTORY_SIZE", &n)?;
        }
        if let Some(secs) = get("HISTORY_SAVE_INTERVAL_SECS") {
            config.history_save_interval =
                Duration::from_secs(parse("HISTORY_SAVE_INTERVAL_SECS", &secs)?);
        }
        if let Some(n) = get("MAX_RETRIES") {
            config.retry.max_retries = parse("MAX_RETRIES", &n)?;
        }
        if let Some(ms) = get("RETRY_BASE_DELAY_MS") {
            config.retry.base_delay_ms = parse("RETRY_BASE_DELAY_MS", &ms)?;
        }
        if let Some(ms) = get("RETRY_MAX_DELAY_MS") {
            config.retry.max_delay_ms = parse("RETRY_MAX_DELAY_MS", &ms)?;
        }
        if let Some(flag) = get("AUTO_RETRY") {
            config.auto_retry = parse("AUTO_RETRY", &flag)?;
        }
        if let Some(secs) = get("STALL_TIMEOUT_SECS") {
            let secs: u64 = parse("STALL_TIMEOUT_SECS", &secs)?;
            config.stall_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = get("DOWNLOAD_TIMEOUT_SECS") {
            let secs: u64 = parse("DOWNLOAD_TIMEOUT_SECS", &secs)?;
            config.download_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(path) = get("YTDLP_PATH") {
            config.ytdlp_path = path;
        }
        config.ffmpeg_path = get("FFMPEG_PATH");
        if let Some(raw) = get("YTDL_OPTIONS") {
            config.extra_ytdlp_args = serde_json::from_str(&raw).map_err(|e| {
                Error::config(format!("YTDL_OPTIONS must be a JSON array of strings: {e}"))
            })?;
        }
        if let Some(secs) = get("INFO_CACHE_TTL_SECS") {
            config.info_cache_ttl = Duration::from_secs(parse("INFO_CACHE_TTL_SECS", &secs)?);
        }
        if let Some(flag) = get("ENABLE_YTDL_UPDATE") {
            config.ytdlp_auto_update = parse("ENABLE_YTDL_UPDATE", &flag)?;
        }
        if let Some(secs) = get("YTDL_UPDATE_INTERVAL") {
            config.ytdlp_update_interval =
                Duration::from_secs(parse("YTDL_UPDATE_INTERVAL", &secs)?);
        }
        config.log_dir = get("LOG_DIR").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(Error::config("max_concurrent_downloads must be at least 1"));
        }
        if self.retry.max_retries > MAX_RETRIES_LIMIT {
            return Err(Error::config(format!(
                "max_retries {} exceeds limit {}",
                self.retry.max_retries, MAX_RETRIES_LIMIT
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::config(format!(
                "retry base delay {}ms exceeds max delay {}ms",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.scheduler_interval.is_zero() || self.history_save_interval.is_zero() {
            return Err(Error::config("scheduler and history intervals must be positive"));
        }
        if self.ytdlp_auto_update && self.ytdlp_update_interval.is_zero() {
            return Err(Error::config("ytdlp_update_interval must be positive"));
        }
        if self.subscriber_buffer == 0 {
            return Err(Error::config("subscriber_buffer must be at least 1"));
        }
        if self.output_template.trim().is_empty() {
            return Err(Error::config("output_template is empty"));
        }
        Ok(())
    }

    /// Engine settings derived from this configuration.
    pub fn ytdlp(&self) -> YtDlpConfig {
        YtDlpConfig {
            binary_path: self.ytdlp_path.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
            extra_args: self.extra_ytdlp_args.clone(),
            info_ttl_secs: self.info_cache_ttl.as_secs(),
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::config(format!("invalid {key} '{value}': {e}")))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
