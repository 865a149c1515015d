use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mediaq::domain::{AudioFormat, DownloadOptions, DownloadRequest, EventType, MediaKind};
use mediaq::engine::{FormatInfo, MediaInfo, format_eta};
use mediaq::{Config, Orchestrator, logging};

/// Download media with yt-dlp and stream job events as JSON lines.
#[derive(Debug, Parser)]
#[command(name = "mediaq", version, about)]
struct Args {
    /// URLs to download.
    #[arg(required = true)]
    urls: Vec<String>,

    /// Extract audio only.
    #[arg(short, long)]
    audio: bool,

    /// Audio format when extracting audio (mp3, flac, ogg, m4a, wav, aac, opus).
    #[arg(long, default_value = "mp3")]
    audio_format: AudioFormat,

    /// Maximum video height, e.g. 720p.
    #[arg(short, long)]
    quality: Option<String>,

    /// Output directory, overriding DOWNLOAD_DIR.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Start the downloads at this RFC 3339 time.
    #[arg(long)]
    at: Option<DateTime<Utc>>,

    /// Download whole playlists.
    #[arg(long)]
    playlist: bool,

    /// Print title and available formats instead of downloading.
    #[arg(long)]
    info: bool,

    /// Log filter, overriding RUST_LOG.
    #[arg(long)]
    log_filter: Option<String>,
}

impl Args {
    fn options(&self) -> DownloadOptions {
        DownloadOptions {
            quality: self.quality.clone(),
            audio_format: self.audio_format,
            playlist: self.playlist,
            output_dir: self.output_dir.clone(),
            ..DownloadOptions::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_env().context("loading configuration")?;

    let logging = logging::init_logging(config.log_dir.as_deref())?;
    if let Some(filter) = &args.log_filter {
        logging.set_filter(filter)?;
    }
    info!(
        filter = %logging.filter(),
        log_dir = ?logging.log_dir(),
        "Logging initialized"
    );
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.child_token());

    let orchestrator = Orchestrator::with_ytdlp(config)?;
    if args.info {
        for url in &args.urls {
            match orchestrator.media_info(url).await {
                Ok(info) => print_info(url, &info),
                Err(e) => warn!(url = %url, error = %e, "Failed to fetch media info"),
            }
        }
        return Ok(());
    }

    let config = orchestrator.config();
    info!(
        download_dir = %config.download_dir.display(),
        max_concurrent = config.max_concurrent_downloads,
        "Starting downloads"
    );
    let mut events = orchestrator.subscribe();
    orchestrator.start().await?;

    let kind = if args.audio {
        MediaKind::Audio
    } else {
        MediaKind::Video
    };
    let options = args.options();

    let mut pending = HashSet::new();
    for url in &args.urls {
        let mut request = DownloadRequest::new(url.clone(), kind).with_options(options.clone());
        if let Some(at) = args.at {
            request = request.with_scheduled_time(at);
        }
        match orchestrator.submit(request) {
            Ok(id) => {
                pending.insert(id);
            }
            Err(e) => warn!(url = %url, error = %e, "Rejected download"),
        }
    }

    while !pending.is_empty() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);

                let finished = match event.event_type {
                    EventType::Completed => true,
                    EventType::Error | EventType::Status => orchestrator
                        .get(&event.job_id)
                        .is_ok_and(|job| job.is_terminal()),
                    _ => false,
                };
                if finished {
                    pending.remove(&event.job_id);
                }
            }
        }
    }

    shutdown.cancel();
    orchestrator.shutdown().await;
    Ok(())
}

fn print_info(url: &str, info: &MediaInfo) {
    println!("{}", info.title.as_deref().unwrap_or(url));
    if let Some(uploader) = &info.uploader {
        println!("  uploader: {uploader}");
    }
    if let Some(duration) = info.duration.and_then(|d| format_eta(d.round() as u64)) {
        println!("  duration: {duration}");
    }
    for format in &info.formats {
        println!("  {}", format_line(format));
    }
}

fn format_line(format: &FormatInfo) -> String {
    let streams = match (format.has_video(), format.has_audio()) {
        (true, true) => "video+audio",
        (true, false) => "video only",
        (false, true) => "audio only",
        (false, false) => "unknown",
    };
    let size = format
        .filesize
        .map(|bytes| format!("{:.1}MiB", bytes as f64 / (1024.0 * 1024.0)))
        .unwrap_or_default();
    format!(
        "{:<10} {:<5} {:<11} {:<11} {}",
        format.format_id,
        format.ext.as_deref().unwrap_or("?"),
        format.resolution.as_deref().unwrap_or(""),
        streams,
        size
    )
    .trim_end()
    .to_string()
}
