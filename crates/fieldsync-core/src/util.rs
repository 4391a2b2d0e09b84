//! Small text and time helpers shared by the services.

/// Trimmed text, or `None` when nothing but whitespace remains.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_owned())
        .filter(|text| !text.is_empty())
}

/// Whether `value` is an absolute HTTP(S) URL.
pub fn is_http_url(value: &str) -> bool {
    ["http://", "https://"]
        .iter()
        .any(|scheme| value.starts_with(scheme))
}

/// First `max_chars` characters of the trimmed text, for log and error lines.
pub fn excerpt(value: &str, max_chars: usize) -> String {
    value.trim().chars().take(max_chars).collect()
}

/// Wall-clock time in Unix milliseconds.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_blank_trims_and_drops_whitespace() {
        assert_eq!(non_blank(None), None);
        assert_eq!(non_blank(Some(" \t ".to_string())), None);
        assert_eq!(
            non_blank(Some("  sync.example.org ".to_string())),
            Some("sync.example.org".to_string())
        );
    }

    #[test]
    fn http_urls_need_a_scheme() {
        assert!(is_http_url("http://10.0.0.2:8080"));
        assert!(is_http_url("https://sync.example.org"));
        assert!(!is_http_url("ftp://sync.example.org"));
        assert!(!is_http_url("sync.example.org"));
    }

    #[test]
    fn excerpt_counts_characters() {
        assert_eq!(excerpt("  évacuation ", 4), "évac");
        assert_eq!(excerpt("ok", 10), "ok");
    }
}
