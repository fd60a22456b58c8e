//! Utility functions for quorumkv

use std::time::{SystemTime, UNIX_EPOCH};

/// Parse a boolean the way form clients send them.
///
/// Accepts `1 t T TRUE true True` and `0 f F FALSE false False`, nothing else.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Parse an unsigned decimal integer with no sign, whitespace or radix prefix.
pub fn parse_u64(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Lexically clean an absolute slash-separated path.
///
/// Collapses repeated slashes, drops `.` elements, resolves `..` against the
/// previous element and never climbs above the root. The result always
/// starts with `/` and has no trailing slash unless it is the root.
pub fn clean_path(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in p.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(p.len() + 1);
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// Join `rest` under an absolute root. `rest` is cleaned on its own first so
/// `..` elements can never climb out of `root`.
pub fn join_path(root: &str, rest: &str) -> String {
    clean_path(&format!("{}{}", root, clean_path(rest)))
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        for s in ["1", "t", "T", "TRUE", "true", "True"] {
            assert_eq!(parse_bool(s), Some(true), "{}", s);
        }
        for s in ["0", "f", "F", "FALSE", "false", "False"] {
            assert_eq!(parse_bool(s), Some(false), "{}", s);
        }
        for s in ["", "yes", "tRuE", "2", " true"] {
            assert_eq!(parse_bool(s), None, "{}", s);
        }
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64("0"), Some(0));
        assert_eq!(parse_u64("42"), Some(42));
        assert_eq!(parse_u64("18446744073709551615"), Some(u64::MAX));
        assert_eq!(parse_u64("18446744073709551616"), None);
        assert_eq!(parse_u64("+1"), None);
        assert_eq!(parse_u64("-1"), None);
        assert_eq!(parse_u64(" 1"), None);
        assert_eq!(parse_u64("0x10"), None);
        assert_eq!(parse_u64(""), None);
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/1/"), "/1");
        assert_eq!(clean_path("/1//foo/./bar"), "/1/foo/bar");
        assert_eq!(clean_path("/1/foo/../bar"), "/1/bar");
        assert_eq!(clean_path("/../../x"), "/x");
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/1", "/foo"), "/1/foo");
        assert_eq!(join_path("/1", ""), "/1");
        assert_eq!(join_path("/1", "foo/bar/"), "/1/foo/bar");
        assert_eq!(join_path("/1", "/../0/members"), "/1/0/members");
    }
}
