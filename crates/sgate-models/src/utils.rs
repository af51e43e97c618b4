//! Text helpers shared across crates.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum length of a diagnostic exposed to clients.
pub const MAX_DIAGNOSTIC_LEN: usize = 200;

static UNIX_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/[\w.\-]+){2,}/?").expect("valid unix path regex"));

static WINDOWS_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]:\\\S*").expect("valid windows path regex"));

/// Reduce a raw error message to something safe to publish.
///
/// Keeps the first non-empty line only (drops stack traces), masks absolute
/// filesystem paths, collapses whitespace and caps the length.
pub fn sanitize_diagnostic(raw: &str) -> String {
    let first_line = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");

    let masked = UNIX_PATH.replace_all(first_line, "<path>");
    let masked = WINDOWS_PATH.replace_all(&masked, "<path>");

    let collapsed = masked.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() > MAX_DIAGNOSTIC_LEN {
        let truncated: String = collapsed.chars().take(MAX_DIAGNOSTIC_LEN).collect();
        format!("{}...", truncated)
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_paths() {
        assert_eq!(
            sanitize_diagnostic("cannot open /var/lib/sgate/in.mkv: no such file"),
            "cannot open <path>: no such file"
        );
        assert_eq!(
            sanitize_diagnostic(r"cannot open C:\media\in.mkv"),
            "cannot open <path>"
        );
    }

    #[test]
    fn test_drops_trace_lines() {
        let raw = "\n  encoder exited with status 139\nstack backtrace:\n  0: main";
        assert_eq!(sanitize_diagnostic(raw), "encoder exited with status 139");
    }

    #[test]
    fn test_keeps_plain_messages() {
        assert_eq!(sanitize_diagnostic("codec  not   supported"), "codec not supported");
        assert_eq!(sanitize_diagnostic("ratio 16/9 kept"), "ratio 16/9 kept");
    }

    #[test]
    fn test_caps_length() {
        let raw = "x".repeat(500);
        let out = sanitize_diagnostic(&raw);
        assert_eq!(out.chars().count(), MAX_DIAGNOSTIC_LEN + 3);
        assert!(out.ends_with("..."));
    }
}
