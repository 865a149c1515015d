//! yt-dlp output line parsing.
//!
//! The engine runs yt-dlp with custom progress templates (see
//! [`super::options`]), so every line on stdout is one of:
//! - `[progress] downloaded|total|estimate|speed|eta|filename`
//! - `[postprocess] status postprocessor`
//! - a bare path printed by `--print after_move:filepath`
//! - other bracketed chatter (`[youtube] ...`, `[download] ...`)
//!
//! Older yt-dlp builds ignore the `postprocess:` template, so the
//! post-processor tags themselves are recognised as well.

use super::traits::EngineProgress;

/// Line prefixes printed by post-processors that rewrite the output.
const POSTPROCESSOR_TAGS: &[&str] = &[
    "ExtractAudio",
    "Merger",
    "VideoConvertor",
    "VideoRemuxer",
    "FixupM3u8",
    "EmbedSubtitle",
];

/// One classified output line.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    /// Transfer progress, plus the file currently being written.
    Progress {
        progress: EngineProgress,
        filename: Option<String>,
    },
    /// A post-processor started or finished.
    PostProcess { status: String, name: String },
    /// Final output path after all post-processing.
    FinalPath(String),
    /// Anything else.
    Other,
}

/// Parse a numeric template field; yt-dlp prints `NA` (or `None`) when missing.
///
/// # Arguments
/// * `field` - Raw field text
///
/// # Returns
/// * `Some(f64)` - Parsed finite, non-negative value
/// * `None` - If the field is missing or malformed
pub fn parse_field(field: &str) -> Option<f64> {
    let field = field.trim();
    if field.is_empty() || field == "NA" || field == "None" {
        return None;
    }
    field
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Parse the body of a `[progress]` line.
///
/// # Arguments
/// * `body` - Text after the `[progress] ` prefix
///
/// # Returns
/// * `Some((progress, filename))` - If the downloaded-bytes field is present
/// * `None` - If the line is malformed
pub fn parse_progress(body: &str) -> Option<(EngineProgress, Option<String>)> {
    let mut fields = body.splitn(6, '|');

    let transferred = parse_field(fields.next()?)? as u64;
    let total = parse_field(fields.next()?);
    let estimate = parse_field(fields.next()?);
    let rate = parse_field(fields.next()?);
    let eta = parse_field(fields.next()?);
    let filename = fields
        .next()
        .map(str::trim)
        .filter(|f| !f.is_empty() && *f != "NA")
        .map(str::to_string);

    Some((
        EngineProgress {
            transferred,
            total: total.or(estimate).map(|t| t as u64),
            rate,
            eta: eta.map(|e| e as u64),
        },
        filename,
    ))
}

/// Classify one stdout line.
pub fn parse_line(line: &str) -> OutputLine {
    let line = line.trim_end();

    if let Some(body) = line.strip_prefix("[progress] ") {
        return match parse_progress(body) {
            Some((progress, filename)) => OutputLine::Progress { progress, filename },
            None => OutputLine::Other,
        };
    }

    if let Some(body) = line.strip_prefix("[postprocess] ") {
        let mut parts = body.splitn(2, ' ');
        let status = parts.next().unwrap_or_default().to_string();
        let name = parts.next().unwrap_or_default().trim().to_string();
        return OutputLine::PostProcess { status, name };
    }

    if let Some(rest) = line.strip_prefix('[')
        && let Some((tag, _)) = rest.split_once(']')
        && POSTPROCESSOR_TAGS.contains(&tag)
    {
        return OutputLine::PostProcess {
            status: "started".to_string(),
            name: tag.to_string(),
        };
    }

    if line.trim().is_empty() || line.starts_with('[') {
        return OutputLine::Other;
    }

    OutputLine::FinalPath(line.trim().to_string())
}

/// Extract the message of a stderr `ERROR:` line.
pub fn parse_error(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix("ERROR:")
        .map(str::trim)
        .filter(|m| !m.is_empty())
}
