//! Media metadata lookup.
//!
//! Engines describe a URL without downloading it: title, uploader, duration
//! and the formats a request can pick with `video_format_id` and
//! `audio_format_id`. Results are cached per URL for a fixed TTL.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::traits::ExtractionError;

/// Default TTL for cached media info (1 hour).
pub const DEFAULT_INFO_TTL: Duration = Duration::from_secs(3600);

/// One downloadable format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    /// `1920x1080`, or `audio only`.
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
    /// Total bitrate in KBit/s.
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
}

impl FormatInfo {
    pub fn has_video(&self) -> bool {
        self.vcodec.as_deref().is_some_and(|c| c != "none")
    }

    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref().is_some_and(|c| c != "none")
    }
}

/// Metadata of a media URL.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub formats: Vec<FormatInfo>,
}

/// Raw `yt-dlp -J` document; only the fields [`MediaInfo`] keeps.
#[derive(Deserialize)]
struct RawInfo {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    resolution: Option<String>,
    fps: Option<f64>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
    tbr: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
}

/// Parse the JSON document printed by `yt-dlp -J`.
///
/// Formats without an id are skipped; the uploader falls back to the channel.
pub fn parse_info(json: &str) -> Result<MediaInfo, ExtractionError> {
    let raw: RawInfo = serde_json::from_str(json)
        .map_err(|e| ExtractionError::failed(format!("unreadable media info: {e}")))?;

    let formats = raw
        .formats
        .into_iter()
        .filter_map(|f| {
            Some(FormatInfo {
                format_id: f.format_id.filter(|id| !id.is_empty())?,
                ext: f.ext,
                resolution: f.resolution,
                fps: f.fps,
                filesize: f.filesize.or(f.filesize_approx),
                tbr: f.tbr,
                vcodec: f.vcodec,
                acodec: f.acodec,
            })
        })
        .collect();

    Ok(MediaInfo {
        title: raw.title,
        uploader: raw.uploader.or(raw.channel),
        duration: raw.duration,
        thumbnail: raw.thumbnail,
        formats,
    })
}

#[derive(Clone)]
struct CacheEntry {
    info: Arc<MediaInfo>,
    expires_at: Instant,
}

/// Per-URL media info cache with TTL eviction.
#[derive(Clone)]
pub struct InfoCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl InfoCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Cached info for `url`, or `None` if absent or expired.
    pub fn get(&self, url: &str) -> Option<Arc<MediaInfo>> {
        let entry = self.entries.get(url)?;

        if Instant::now() >= entry.expires_at {
            drop(entry); // Release the shard lock before removing
            self.entries.remove(url);
            return None;
        }

        Some(entry.info.clone())
    }

    pub fn insert(&self, url: impl Into<String>, info: Arc<MediaInfo>) {
        let entry = CacheEntry {
            info,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.insert(url.into(), entry);
    }
}

impl Default for InfoCache {
    fn default() -> Self {
        Self::new(DEFAULT_INFO_TTL)
    }
}
