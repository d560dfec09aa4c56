//! Text and clock helpers shared by config, transport and the replica.

/// Longest error text kept in outbox records and log lines
const MAX_ERROR_CHARS: usize = 180;

/// Trimmed text, or `None` when only whitespace is left
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_owned())
        .filter(|text| !text.is_empty())
}

pub fn is_http_url(value: &str) -> bool {
    ["http://", "https://"]
        .iter()
        .any(|scheme| value.starts_with(scheme))
}

/// Error text folded onto one line and capped at `MAX_ERROR_CHARS`
pub fn compact_text(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_ERROR_CHARS)
        .collect()
}

/// Unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn blank_settings_read_as_unset() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some(" \t\n".to_string())), None);
        assert_eq!(
            normalize_text_option(Some("  deskline.db ".to_string())).as_deref(),
            Some("deskline.db")
        );
    }

    #[test]
    fn only_http_schemes_are_urls() {
        assert!(is_http_url("https://sync.example.com"));
        assert!(is_http_url("http://127.0.0.1:8080"));
        assert!(!is_http_url("ws://sync.example.com"));
        assert!(!is_http_url("sync.example.com"));
    }

    #[test]
    fn error_text_is_one_capped_line() {
        assert_eq!(compact_text("  upstream\n  timed   out "), "upstream timed out");
        assert_eq!(compact_text(&"e".repeat(400)).chars().count(), MAX_ERROR_CHARS);
    }
}
