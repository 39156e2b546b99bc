//! URL heuristics: start-URL extraction from task text, URL shortening for
//! outgoing LLM messages, and domain pattern matching.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s'"<>\)\]\}]+"#).expect("valid URL regex"));

/// Default tail length above which URLs in outgoing text are shortened
pub const URL_SHORTENING_LIMIT: usize = 25;

/// Words that, appearing shortly before a URL, mean the task forbids it
const NEGATION_WORDS: &[&str] = &["never", "don't", "do not", "avoid", "except"];

/// File-extension tokens that disqualify a URL as a start URL. Matched
/// anywhere in the path, so `/foo.zip/bar` is excluded too.
const FILE_EXTENSION_TOKENS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".zip", ".tar", ".gz", ".rar",
    ".7z", ".exe", ".dmg", ".pkg", ".deb", ".rpm", ".csv", ".png", ".jpg", ".jpeg", ".gif",
    ".svg", ".mp3", ".mp4", ".avi", ".mov",
];

fn trim_trailing_punctuation(url: &str) -> &str {
    url.trim_end_matches(['.', ',', ';', ':', '!', '?', '\'', '"'])
}

/// Extract at most one start URL from task text.
///
/// A URL is skipped when a negation word appears within the 20 characters
/// before it, or when its path contains a file-extension token.
pub fn extract_start_url(task: &str) -> Option<String> {
    for m in URL_RE.find_iter(task) {
        let candidate = trim_trailing_punctuation(m.as_str());

        let context_start = m.start().saturating_sub(20);
        // Snap to a char boundary in case the window lands mid-codepoint.
        let context_start = (0..=context_start)
            .rev()
            .find(|i| task.is_char_boundary(*i))
            .unwrap_or(0);
        let left_context = task[context_start..m.start()].to_lowercase();
        if NEGATION_WORDS.iter().any(|w| left_context.contains(w)) {
            continue;
        }

        let Ok(parsed) = Url::parse(candidate) else {
            continue;
        };
        let path = parsed.path().to_lowercase();
        if FILE_EXTENSION_TOKENS.iter().any(|ext| path.contains(ext)) {
            continue;
        }

        return Some(candidate.to_string());
    }
    None
}

fn hash7(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..7].to_string()
}

/// Shorten long URLs in outgoing text.
///
/// `scheme://host<tail>` becomes `scheme://host<tail[..limit]>…<7-hex-hash>`
/// when the tail is at least `limit` characters. Returns the rewritten text
/// and a reverse map from shortened form to original.
pub fn shorten_urls_in_text(text: &str, limit: usize) -> (String, HashMap<String, String>) {
    let mut map = HashMap::new();
    let result = URL_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let full = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            let Ok(parsed) = Url::parse(full) else {
                return full.to_string();
            };
            let host_end = match (parsed.host_str(), full.find(parsed.host_str().unwrap_or(""))) {
                (Some(host), Some(pos)) => pos + host.len(),
                _ => return full.to_string(),
            };
            // Port belongs to the head, not the tail.
            let host_end = match full[host_end..].strip_prefix(':') {
                Some(rest) => {
                    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
                    host_end + 1 + digits
                }
                None => host_end,
            };
            let (head, tail) = full.split_at(host_end);
            if tail.chars().count() < limit {
                return full.to_string();
            }
            let kept: String = tail.chars().take(limit).collect();
            let short = format!("{head}{kept}…{}", hash7(tail));
            map.insert(short.clone(), full.to_string());
            short
        })
        .to_string();
    (result, map)
}

/// Reverse URL shortening in a text fragment
pub fn unshorten_text(text: &str, map: &HashMap<String, String>) -> String {
    let mut result = text.to_string();
    for (short, full) in map {
        if result.contains(short.as_str()) {
            result = result.replace(short.as_str(), full);
        }
    }
    result
}

/// Reverse URL shortening across every string in a JSON value
pub fn unshorten_value(value: &mut Value, map: &HashMap<String, String>) {
    match value {
        Value::String(s) => {
            let replaced = unshorten_text(s, map);
            if replaced != *s {
                *s = replaced;
            }
        }
        Value::Array(items) => {
            for item in items {
                unshorten_value(item, map);
            }
        }
        Value::Object(entries) => {
            for (_, item) in entries.iter_mut() {
                unshorten_value(item, map);
            }
        }
        _ => {}
    }
}

/// Match a domain pattern against a URL.
///
/// Patterns: exact host, `*` (any), `*.apex.tld` (apex or subdomain). An
/// optional `scheme://` prefix constrains the scheme.
pub fn domain_matches(pattern: &str, url_str: &str) -> bool {
    let Ok(parsed) = Url::parse(url_str) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };

    let (scheme_pattern, host_pattern) = match pattern.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, pattern),
    };
    if let Some(scheme) = scheme_pattern
        && scheme != "*"
        && scheme != parsed.scheme()
    {
        return false;
    }
    let host_pattern = host_pattern.trim_end_matches('/');

    if host_pattern == "*" {
        return true;
    }
    if let Some(apex) = host_pattern.strip_prefix("*.") {
        return host == apex || host.ends_with(&format!(".{apex}"));
    }
    host == host_pattern
}

/// Policy check for action domain filters: rejects patterns so broad they
/// would match essentially every site.
pub fn validate_action_domain_pattern(pattern: &str) -> Result<(), String> {
    let host_pattern = pattern.split_once("://").map_or(pattern, |(scheme, rest)| {
        if rest.is_empty() || rest == "*" {
            return "*";
        }
        let _ = scheme;
        rest
    });
    let host_pattern = host_pattern.trim_end_matches('/');

    if host_pattern.is_empty() || host_pattern == "*" {
        return Err(format!("domain pattern {pattern:?} is too broad"));
    }
    if let Some(apex) = host_pattern.strip_prefix("*.")
        && !apex.contains('.')
    {
        // "*.com" style: wildcard over an entire TLD
        return Err(format!("domain pattern {pattern:?} is too broad"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_url_from_task() {
        let url = extract_start_url("Find the cheapest flight on https://example.com/search");
        assert_eq!(url.as_deref(), Some("https://example.com/search"));
    }

    #[test]
    fn negation_suppresses_extraction() {
        let url = extract_start_url("Never go to http://evil.test, use search instead");
        assert_eq!(url, None);
    }

    #[test]
    fn negation_window_is_limited_to_nearby_text() {
        let task =
            "Never mind the weather, the forecast is irrelevant here. Check https://example.com";
        assert_eq!(
            extract_start_url(task).as_deref(),
            Some("https://example.com")
        );
    }

    #[test]
    fn file_extension_anywhere_in_path_disqualifies() {
        assert_eq!(extract_start_url("open https://host.test/report.pdf"), None);
        assert_eq!(
            extract_start_url("open https://host.test/foo.zip/bar"),
            None
        );
        assert_eq!(
            extract_start_url("open https://host.test/reports/latest").as_deref(),
            Some("https://host.test/reports/latest")
        );
    }

    #[test]
    fn url_shortening_roundtrips() {
        let text = format!(
            "go to https://example.com/{} now",
            "a/very/long/path/segment/that/keeps/going/and/going"
        );
        let (short, map) = shorten_urls_in_text(&text, URL_SHORTENING_LIMIT);
        assert_ne!(short, text);
        assert!(short.contains('…'));
        assert_eq!(unshorten_text(&short, &map), text);
    }

    #[test]
    fn short_urls_are_left_alone() {
        let text = "go to https://example.com/a now";
        let (out, map) = shorten_urls_in_text(text, URL_SHORTENING_LIMIT);
        assert_eq!(out, text);
        assert!(map.is_empty());
    }

    #[test]
    fn unshorten_walks_nested_json() {
        let text = format!(
            "https://example.com/{}",
            "one/two/three/four/five/six/seven/eight/nine"
        );
        let (short, map) = shorten_urls_in_text(&text, URL_SHORTENING_LIMIT);
        let mut value = serde_json::json!({
            "action": [{"go_to_url": {"url": short}}],
        });
        unshorten_value(&mut value, &map);
        assert_eq!(value["action"][0]["go_to_url"]["url"], text);
    }

    #[test]
    fn domain_pattern_matching() {
        assert!(domain_matches("example.com", "https://example.com/page"));
        assert!(!domain_matches("example.com", "https://sub.example.com/"));
        assert!(domain_matches("*.example.com", "https://sub.example.com/"));
        assert!(domain_matches("*.example.com", "https://example.com/"));
        assert!(domain_matches("*", "https://anything.test/"));
        assert!(domain_matches(
            "https://example.com",
            "https://example.com/x"
        ));
        assert!(!domain_matches("https://example.com", "http://example.com/"));
    }

    #[test]
    fn broad_domain_patterns_are_rejected() {
        assert!(validate_action_domain_pattern("*").is_err());
        assert!(validate_action_domain_pattern("*.com").is_err());
        assert!(validate_action_domain_pattern("http://*").is_err());
        assert!(validate_action_domain_pattern("*.example.com").is_ok());
        assert!(validate_action_domain_pattern("example.com").is_ok());
    }
}
