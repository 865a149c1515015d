//! Download request and its validation.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Upper bound accepted for a per-request retry ceiling.
pub const MAX_RETRIES_LIMIT: u32 = 10;

static QUALITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{2,4}p?$").expect("valid quality regex"));

static SPEED_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?[KMGkmg]?$").expect("valid speed regex"));

/// Kind of media to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Video,
    Audio,
}

/// Target audio container for audio-only extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Flac,
    Ogg,
    M4a,
    Wav,
    Aac,
    Opus,
}

impl AudioFormat {
    /// Codec name understood by the extractor's audio post-processor.
    pub fn codec(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Flac => "flac",
            Self::Ogg => "vorbis",
            Self::M4a => "m4a",
            Self::Wav => "wav",
            Self::Aac => "aac",
            Self::Opus => "opus",
        }
    }

    /// Preferred quality: `0` for lossless targets, a bitrate otherwise.
    pub fn quality(&self) -> &'static str {
        match self {
            Self::Flac | Self::Wav => "0",
            Self::Opus => "128K",
            Self::Mp3 | Self::Ogg | Self::M4a | Self::Aac => "192K",
        }
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "flac" => Ok(Self::Flac),
            "ogg" | "vorbis" => Ok(Self::Ogg),
            "m4a" => Ok(Self::M4a),
            "wav" => Ok(Self::Wav),
            "aac" => Ok(Self::Aac),
            "opus" => Ok(Self::Opus),
            other => Err(Error::validation(format!("unsupported audio format: {other}"))),
        }
    }
}

/// Subtitle download options.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubtitleOptions {
    /// Languages to fetch, e.g. `["en", "de"]`.
    pub languages: Vec<String>,
    /// Embed into the output container instead of writing side files.
    #[serde(default)]
    pub embed: bool,
}

/// Immutable extraction parameters of a job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Raw format selector (`best` when unset).
    pub format: Option<String>,
    /// Maximum video height, e.g. `1080`.
    pub quality: Option<String>,
    pub audio_format: AudioFormat,
    pub video_format_id: Option<String>,
    pub audio_format_id: Option<String>,
    pub playlist: bool,
    /// Overrides the configured download directory.
    pub output_dir: Option<PathBuf>,
    /// Overrides the configured filename template.
    pub output_template: Option<String>,
    /// Overrides the configured proxy.
    pub proxy: Option<String>,
    pub subtitles: Option<SubtitleOptions>,
    /// Rate limit such as `500K` or `2M`.
    pub speed_limit: Option<String>,
    /// Extra extractor arguments appended last.
    pub custom_args: Vec<String>,
}

/// A submission from the command surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub kind: MediaKind,
    #[serde(default)]
    pub options: DownloadOptions,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Falls back to the configured default when unset.
    #[serde(default)]
    pub auto_retry: Option<bool>,
    /// Falls back to the configured default when unset.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl DownloadRequest {
    /// Create a new request with default options.
    pub fn new(url: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            url: url.into(),
            kind,
            options: DownloadOptions::default(),
            scheduled_time: None,
            auto_retry: None,
            max_retries: None,
        }
    }

    /// Set the activation time.
    pub fn with_scheduled_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    /// Set the options.
    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Enable or disable automatic retries.
    pub fn with_auto_retry(mut self, auto_retry: bool) -> Self {
        self.auto_retry = Some(auto_retry);
        self
    }

    /// Reject malformed submissions before a job is created.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.url)?;

        let opts = &self.options;

        if let Some(quality) = &opts.quality
            && !QUALITY_RE.is_match(quality)
        {
            return Err(Error::validation(format!("invalid quality: {quality}")));
        }

        if let Some(limit) = &opts.speed_limit
            && !SPEED_LIMIT_RE.is_match(limit)
        {
            return Err(Error::validation(format!("invalid speed limit: {limit}")));
        }

        if let Some(template) = &opts.output_template {
            validate_template(template)?;
        }

        if let Some(subs) = &opts.subtitles
            && subs.languages.iter().any(|l| l.trim().is_empty())
        {
            return Err(Error::validation("empty subtitle language"));
        }

        if let Some(max) = self.max_retries
            && max > MAX_RETRIES_LIMIT
        {
            return Err(Error::validation(format!(
                "max_retries {max} exceeds limit {MAX_RETRIES_LIMIT}"
            )));
        }

        Ok(())
    }
}

/// Accept only absolute http(s) URLs with a host.
pub fn validate_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::validation(format!("invalid url '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::validation(format!(
            "unsupported url scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::validation("url has no host"));
    }
    Ok(url)
}

fn validate_template(template: &str) -> Result<()> {
    if template.trim().is_empty() {
        return Err(Error::validation("output template is empty"));
    }
    let path = Path::new(template);
    if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(Error::validation(format!(
            "output template must stay inside the output directory: {template}"
        )));
    }
    Ok(())
}
