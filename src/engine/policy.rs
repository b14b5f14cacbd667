//! Filename and path policy — pure, stateless helpers.
//!
//! Grounded on the teacher's `ensure_key_safe`/`ensure_bucket_name_safe`
//! validation style, generalized to produce deterministic, safe stored
//! names and date-partitioned backend keys.

use chrono::{DateTime, Utc};

const MAX_BASE_LEN: usize = 20;
const MAX_STORED_NAME_LEN: usize = 255;

/// Replace any character outside `{Unicode letter, Unicode digit, '.', '_',
/// '-'}` with `_`; collapse runs of `_`; trim leading/trailing `_`; yield
/// `"file"` if the result is empty.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_underscore = false;
    for ch in name.chars() {
        let keep = ch.is_alphanumeric() || matches!(ch, '.' | '_' | '-');
        if keep {
            out.push(ch);
            last_was_underscore = ch == '_';
        } else if !last_was_underscore {
            out.push('_');
            last_was_underscore = true;
        }
    }
    let trimmed = out.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed
    }
}

/// Split a sanitized filename into (base, extension) where `extension`
/// includes no leading dot and may be empty.
fn split_extension(sanitized: &str) -> (&str, &str) {
    match sanitized.rfind('.') {
        Some(idx) if idx > 0 && idx < sanitized.len() - 1 => (&sanitized[..idx], &sanitized[idx + 1..]),
        _ => (sanitized, ""),
    }
}

/// Truncate the sanitized base (without extension) to 20 chars, append
/// `_<first-8-hex-of-hash>`, re-append the lowercased extension. Total
/// length is bounded at 255.
pub fn safe_stored_name(original_name: &str, hash: &str) -> String {
    let sanitized = sanitize_name(original_name);
    let (base, ext) = split_extension(&sanitized);
    let truncated_base: String = base.chars().take(MAX_BASE_LEN).collect();
    let suffix: String = hash.chars().take(8).collect();
    let ext_lower = ext.to_lowercase();

    let mut stored = format!("{truncated_base}_{suffix}");
    if !ext_lower.is_empty() {
        stored.push('.');
        stored.push_str(&ext_lower);
    }
    stored.chars().take(MAX_STORED_NAME_LEN).collect()
}

/// `YYYY-MM` partition for a UTC timestamp.
pub fn date_prefix(t: DateTime<Utc>) -> String {
    t.format("%Y-%m").to_string()
}

/// Normalize separators and join parts into a canonical backend key.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize_name("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_name("hello world.txt"), "hello_world.txt");
        assert_eq!(sanitize_name("***"), "file");
        assert_eq!(sanitize_name(""), "file");
    }

    #[test]
    fn sanitize_preserves_unicode_letters() {
        assert_eq!(sanitize_name("héllo.txt"), "héllo.txt");
    }

    #[test]
    fn safe_stored_name_bounds_length_and_keeps_extension() {
        let long_name = "a".repeat(300) + ".png";
        let stored = safe_stored_name(&long_name, "0123456789abcdef");
        assert!(stored.len() <= MAX_STORED_NAME_LEN);
        assert!(stored.ends_with(".png"));
        assert!(stored.contains("01234567"));
    }

    #[test]
    fn safe_stored_name_matches_greeting_example() {
        let stored = safe_stored_name("greeting.txt", "b94d27b9934d3e08");
        assert_eq!(stored, "greeting_b94d27b9.txt");
    }

    #[test]
    fn date_prefix_formats_year_month() {
        let t = DateTime::parse_from_rfc3339("2026-07-28T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(date_prefix(t), "2026-07");
    }

    #[test]
    fn join_key_normalizes_separators() {
        assert_eq!(join_key(&["2026-07/", "/greeting_abcd.txt"]), "2026-07/greeting_abcd.txt");
    }
}
