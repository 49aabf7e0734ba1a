use crate::models::LogLevel;
use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ansi escape regex"));

static FAILURE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\u{2717}|\u{2718}|\bfail(ed|ing|ure|s)?\b)").expect("valid failure regex")
});

static SUCCESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\u{2713}|\u{2714}|\bpass(ed|es|ing)?\b)").expect("valid success regex")
});

static SKIP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bskip(ped|ping|s)?\b").expect("valid skip regex"));

pub fn sanitize_terminal_chunk(value: &str) -> String {
    let stripped = ANSI_ESCAPE_RE.replace_all(value, "");
    stripped.replace('\r', "")
}

/// Best-effort annotation of a single output line. Never authoritative: a run's
/// status comes from its exit code alone.
///
/// Diagnostic prefixes win, then failure markers, then success, then skip, so a
/// summary such as `3 passed, 1 failed` reads as a failure.
pub fn classify_line(line: &str) -> Option<(LogLevel, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("error:") || lower.starts_with("fatal:") {
        return Some((LogLevel::Error, trimmed.to_string()));
    }
    if lower.starts_with("warning:") || lower.starts_with("warn:") {
        return Some((LogLevel::Warning, trimmed.to_string()));
    }
    if FAILURE_RE.is_match(trimmed) {
        return Some((LogLevel::Error, trimmed.to_string()));
    }
    if SUCCESS_RE.is_match(trimmed) {
        return Some((LogLevel::Success, trimmed.to_string()));
    }
    if SKIP_RE.is_match(trimmed) {
        return Some((LogLevel::Skip, trimmed.to_string()));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::{classify_line, sanitize_terminal_chunk};
    use crate::models::LogLevel;

    #[test]
    fn check_mark_reads_as_success() {
        let (level, message) = classify_line("Running test A \u{2713}").expect("marker");
        assert_eq!(level, LogLevel::Success);
        assert_eq!(message, "Running test A \u{2713}");
        assert!(classify_line("Running test A").is_none());
    }

    #[test]
    fn failure_beats_success_on_summary_lines() {
        let (level, _) = classify_line("  3 passed, 1 failed (2.1s)").expect("marker");
        assert_eq!(level, LogLevel::Error);
    }

    #[test]
    fn detects_skip_and_diagnostics() {
        assert_eq!(classify_line("  2 skipped").map(|(level, _)| level), Some(LogLevel::Skip));
        assert_eq!(
            classify_line("Warning: retrying flaky test").map(|(level, _)| level),
            Some(LogLevel::Warning)
        );
        assert_eq!(
            classify_line("ERROR: browser not installed").map(|(level, _)| level),
            Some(LogLevel::Error)
        );
        assert!(classify_line("   ").is_none());
        assert!(classify_line("bypassed cache").is_none());
    }

    #[test]
    fn strips_ansi_sequences() {
        assert_eq!(sanitize_terminal_chunk("\x1b[32mok\x1b[0m\r"), "ok");
    }
}
