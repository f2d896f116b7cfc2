//! Utility helpers — path resolution, duration strings, address parsing.

use std::path::PathBuf;
use std::time::Duration;

/// Get the Deskmail data directory (e.g. `~/.deskmail/`).
pub fn get_data_path() -> PathBuf {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".deskmail")
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("USERPROFILE").ok().map(PathBuf::from))
}

/// Parse a Go-style duration string such as `"30s"`, `"5m"`, `"1h30m"` or
/// `"250ms"`. Returns `None` for empty or malformed input.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let secs = match unit {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return None,
        };
        total += Duration::from_secs_f64(secs);
    }
    Some(total)
}

/// Parse a duration, falling back to `default` when the string is empty or invalid.
pub fn duration_or(s: &str, default: Duration) -> Duration {
    parse_duration(s).unwrap_or(default)
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`.
///
/// `attempt` is 1-based; `0` is treated as `1`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exp).min(max)
}

/// Extract the bare, lowercased address from a header value.
///
/// Handles `user@example.com`, `"User Name" <user@example.com>` and
/// `User Name <user@example.com>`.
pub fn extract_email_address(header: &str) -> String {
    if let Some(start) = header.rfind('<') {
        if let Some(end) = header.rfind('>') {
            if end > start {
                return header[start + 1..end].trim().to_lowercase();
            }
        }
    }
    header.trim().trim_matches('"').to_lowercase()
}

/// Extract the display name from a header value, if any.
pub fn extract_display_name(header: &str) -> String {
    match header.rfind('<') {
        Some(start) => header[..start].trim().trim_matches('"').trim().to_string(),
        None => String::new(),
    }
}

/// Truncate a string to `max_len` characters, adding "..." if truncated.
/// Unicode-safe.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
