//! Human-readable speed and ETA strings.

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

/// Format a transfer rate in bytes/sec.
///
/// Returns `None` for non-positive or non-finite rates.
pub fn format_speed(bytes_per_sec: f64) -> Option<String> {
    if !bytes_per_sec.is_finite() || bytes_per_sec <= 0.0 {
        return None;
    }

    let formatted = if bytes_per_sec > MIB {
        format!("{:.1}MB/s", bytes_per_sec / MIB)
    } else if bytes_per_sec > KIB {
        format!("{:.1}KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.1}B/s", bytes_per_sec)
    };
    Some(formatted)
}

/// Format a remaining time in seconds as `Ns`, `Mm Ss` or `Hh Mm`.
///
/// Returns `None` for zero.
pub fn format_eta(secs: u64) -> Option<String> {
    if secs == 0 {
        return None;
    }

    let formatted = if secs > 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs > 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    };
    Some(formatted)
}
