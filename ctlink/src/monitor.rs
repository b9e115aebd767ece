//! Controller log text helpers.
//!
//! Controllers print free-running diagnostics on the serial stream. The
//! stream parser cleans each line with [`clean_log_text`]; monitor front-ends
//! render lines with [`format_log_line`].

use std::{
    fmt::Write as _,
    time::{SystemTime, UNIX_EPOCH},
};

/// Strip control characters from controller output.
///
/// Tabs survive, carriage returns become newlines, every other control
/// character (bell, escape sequences, NUL padding) is dropped.
pub fn clean_log_text(text: &str) -> String {
    text.chars()
        .filter_map(|ch| match ch {
            '\n' | '\t' => Some(ch),
            '\r' => Some('\n'),
            _ if ch.is_control() => None,
            _ => Some(ch),
        })
        .collect()
}

/// Wall-clock `HH:MM:SS.mmm` (UTC).
pub fn timestamp_now() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        now.subsec_millis()
    )
}

/// Render one controller log line for display.
///
/// With `timestamp`, each line gets a dimmed `[HH:MM:SS.mmm]` prefix.
pub fn format_log_line(line: &str, timestamp: bool) -> String {
    let mut out = String::with_capacity(line.len() + 24);
    if timestamp {
        let _ = write!(out, "\x1b[90m[{}]\x1b[0m ", timestamp_now());
    }
    out.push_str(line.trim_end_matches(['\r', '\n']));
    out
}
