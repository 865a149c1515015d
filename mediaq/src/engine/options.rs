//! yt-dlp command-line construction.

use crate::domain::MediaKind;

use super::traits::EngineRequest;

/// Progress line template; fields are separated by `|`, missing values print `NA`.
pub const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s|%(progress.filename)s";

/// Post-processor hook template.
pub const POSTPROCESS_TEMPLATE: &str =
    "postprocess:[postprocess] %(progress.status)s %(progress.postprocessor)s";

/// Fallback format chain when ffmpeg cannot merge separate streams.
const SINGLE_FILE_FORMAT: &str = "best[ext=mp4]/best[ext=webm]/best";

/// Engine-level settings that shape every command line.
#[derive(Debug, Clone, Default)]
pub struct ArgSettings {
    /// Whether ffmpeg is installed (merging and audio conversion need it).
    pub ffmpeg_available: bool,
    /// Path to ffmpeg, passed through as `--ffmpeg-location`.
    pub ffmpeg_location: Option<String>,
    /// Arguments added to every invocation before per-request ones.
    pub extra_args: Vec<String>,
}

/// Build the full argument list for one attempt.
pub fn build_args(request: &EngineRequest, settings: &ArgSettings) -> Vec<String> {
    let opts = &request.options;
    let mut args: Vec<String> = vec![
        "--newline".into(),
        "--progress".into(),
        "--no-colors".into(),
        "--no-simulate".into(),
        "--progress-template".into(),
        PROGRESS_TEMPLATE.into(),
        "--progress-template".into(),
        POSTPROCESS_TEMPLATE.into(),
        "--print".into(),
        "after_move:filepath".into(),
    ];

    let output = request.output_dir.join(&request.output_template);
    args.push("-o".into());
    args.push(output.to_string_lossy().into_owned());

    if !opts.playlist {
        args.push("--no-playlist".into());
    }

    match request.kind {
        MediaKind::Audio => {
            args.push("-f".into());
            args.push(
                opts.audio_format_id
                    .clone()
                    .unwrap_or_else(|| "bestaudio/best".to_string()),
            );
            args.extend([
                "-x".into(),
                "--audio-format".into(),
                opts.audio_format.codec().into(),
                "--audio-quality".into(),
                opts.audio_format.quality().into(),
            ]);
        }
        MediaKind::Video => {
            args.push("-f".into());
            args.push(video_format(request, settings.ffmpeg_available));
            if settings.ffmpeg_available {
                args.push("--merge-output-format".into());
                args.push("mp4".into());
            }
        }
    }

    if let Some(location) = &settings.ffmpeg_location {
        args.push("--ffmpeg-location".into());
        args.push(location.clone());
    }

    if let Some(subs) = &opts.subtitles
        && !subs.languages.is_empty()
    {
        args.push("--write-subs".into());
        args.push("--sub-langs".into());
        args.push(subs.languages.join(","));
        if subs.embed && settings.ffmpeg_available {
            args.push("--embed-subs".into());
        }
    }

    if let Some(proxy) = &request.proxy {
        args.push("--proxy".into());
        args.push(proxy.clone());
    }

    if let Some(limit) = &opts.speed_limit {
        args.push("--limit-rate".into());
        args.push(limit.clone());
    }

    args.extend(settings.extra_args.iter().cloned());
    args.extend(opts.custom_args.iter().cloned());

    args.push("--".into());
    args.push(request.url.clone());
    args
}

/// Format selector for video jobs.
///
/// Explicit format ids win, then a raw selector, then a height cap. Without
/// ffmpeg only single-file formats can be used.
fn video_format(request: &EngineRequest, ffmpeg_available: bool) -> String {
    let opts = &request.options;

    match (&opts.video_format_id, &opts.audio_format_id) {
        (Some(v), Some(a)) if ffmpeg_available => return format!("{v}+{a}"),
        (Some(v), _) => return v.clone(),
        (None, Some(a)) => return a.clone(),
        (None, None) => {}
    }

    if let Some(format) = &opts.format
        && format != "best"
    {
        return format.clone();
    }

    if !ffmpeg_available {
        return SINGLE_FILE_FORMAT.to_string();
    }

    match &opts.quality {
        Some(quality) => {
            let height = quality.trim_end_matches('p');
            format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]")
        }
        None => "bestvideo+bestaudio/best".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AudioFormat, DownloadOptions, SubtitleOptions};
    use std::path::PathBuf;

    fn request(kind: MediaKind, options: DownloadOptions) -> EngineRequest {
        EngineRequest {
            job_id: "job".into(),
            url: "https://example.com/watch?v=1".into(),
            kind,
            options,
            output_dir: PathBuf::from("/downloads"),
            output_template: "%(title)s.%(ext)s".into(),
            proxy: None,
        }
    }

    fn with_ffmpeg() -> ArgSettings {
        ArgSettings {
            ffmpeg_available: true,
            ..Default::default()
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_audio_uses_codec_and_quality() {
        let args = build_args(
            &request(
                MediaKind::Audio,
                DownloadOptions {
                    audio_format: AudioFormat::Ogg,
                    ..Default::default()
                },
            ),
            &with_ffmpeg(),
        );

        assert!(args.contains(&"-x".to_string()));
        assert_eq!(value_after(&args, "--audio-format"), Some("vorbis"));
        assert_eq!(value_after(&args, "--audio-quality"), Some("192K"));
        assert_eq!(value_after(&args, "-f"), Some("bestaudio/best"));
    }

    #[test]
    fn test_video_quality_cap() {
        let args = build_args(
            &request(
                MediaKind::Video,
                DownloadOptions {
                    quality: Some("720p".into()),
                    ..Default::default()
                },
            ),
            &with_ffmpeg(),
        );

        assert_eq!(
            value_after(&args, "-f"),
            Some("bestvideo[height<=720]+bestaudio/best[height<=720]")
        );
        assert_eq!(value_after(&args, "--merge-output-format"), Some("mp4"));
    }

    #[test]
    fn test_video_without_ffmpeg_uses_single_file() {
        let args = build_args(
            &request(
                MediaKind::Video,
                DownloadOptions {
                    quality: Some("1080".into()),
                    ..Default::default()
                },
            ),
            &ArgSettings::default(),
        );

        assert_eq!(value_after(&args, "-f"), Some(SINGLE_FILE_FORMAT));
        assert!(!args.contains(&"--merge-output-format".to_string()));
    }

    #[test]
    fn test_format_ids() {
        let opts = DownloadOptions {
            video_format_id: Some("137".into()),
            audio_format_id: Some("140".into()),
            ..Default::default()
        };
        let req = request(MediaKind::Video, opts);

        let args = build_args(&req, &with_ffmpeg());
        assert_eq!(value_after(&args, "-f"), Some("137+140"));

        let args = build_args(&req, &ArgSettings::default());
        assert_eq!(value_after(&args, "-f"), Some("137"));
    }

    #[test]
    fn test_subtitles_proxy_rate_and_extra_args_order() {
        let mut req = request(
            MediaKind::Video,
            DownloadOptions {
                subtitles: Some(SubtitleOptions {
                    languages: vec!["en".into(), "de".into()],
                    embed: true,
                }),
                speed_limit: Some("2M".into()),
                custom_args: vec!["--no-mtime".into()],
                ..Default::default()
            },
        );
        req.proxy = Some("socks5://127.0.0.1:1080".into());
        let settings = ArgSettings {
            ffmpeg_available: true,
            ffmpeg_location: None,
            extra_args: vec!["--geo-bypass".into()],
        };

        let args = build_args(&req, &settings);
        assert_eq!(value_after(&args, "--sub-langs"), Some("en,de"));
        assert!(args.contains(&"--embed-subs".to_string()));
        assert_eq!(value_after(&args, "--proxy"), Some("socks5://127.0.0.1:1080"));
        assert_eq!(value_after(&args, "--limit-rate"), Some("2M"));

        let extra = args.iter().position(|a| a == "--geo-bypass").unwrap();
        let custom = args.iter().position(|a| a == "--no-mtime").unwrap();
        assert!(extra < custom);
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/watch?v=1"));
    }

    #[test]
    fn test_playlist_flag() {
        let args = build_args(&request(MediaKind::Video, DownloadOptions::default()), &with_ffmpeg());
        assert!(args.contains(&"--no-playlist".to_string()));

        let args = build_args(
            &request(
                MediaKind::Video,
                DownloadOptions {
                    playlist: true,
                    ..Default::default()
                },
            ),
            &with_ffmpeg(),
        );
        assert!(!args.contains(&"--no-playlist".to_string()));
    }

    #[test]
    fn test_output_joins_dir_and_template() {
        let args = build_args(&request(MediaKind::Video, DownloadOptions::default()), &with_ffmpeg());
        let output = PathBuf::from(value_after(&args, "-o").unwrap());
        assert_eq!(output, PathBuf::from("/downloads").join("%(title)s.%(ext)s"));
    }
}
