//! Common utility functions used across Workshop components

use chrono::Utc;
use uuid::Uuid;

/// Generate a unique ID for instances, elements and conversations
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a short ID for display purposes (8 characters)
pub fn generate_short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Generate an ID with a readable prefix, e.g. `conv_1a2b3c4d`
pub fn generate_prefixed_id(prefix: &str) -> String {
    format!("{}_{}", prefix, generate_short_id())
}

/// Get current UTC timestamp as milliseconds
pub fn current_timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Order-independent key for a pair of agent ids
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}|{}", a, b)
    } else {
        format!("{}|{}", b, a)
    }
}

/// Order-independent key for any set of agent ids
pub fn group_key<S: AsRef<str>>(ids: &[S]) -> String {
    let mut sorted: Vec<&str> = ids.iter().map(|s| s.as_ref()).collect();
    sorted.sort_unstable();
    sorted.join("|")
}

/// Make an arbitrary key (e.g. a host name with a port) safe to use as a file name
pub fn sanitize_key(key: &str) -> String {
    let invalid_chars = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let mut sanitized: String = key
        .chars()
        .map(|c| if invalid_chars.contains(&c) { '_' } else { c })
        .collect();

    sanitized = sanitized.trim().trim_matches('.').to_string();
    if sanitized.is_empty() {
        sanitized = "default".to_string();
    }
    sanitized
}

/// Truncate string to at most `max_chars` characters with ellipsis
pub fn truncate_string(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else if max_chars <= 3 {
        "...".to_string()
    } else {
        let head: String = s.chars().take(max_chars - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ids() {
        let id1 = generate_id();
        let id2 = generate_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36); // UUID length

        let short_id = generate_short_id();
        assert_eq!(short_id.len(), 8);

        let prefixed = generate_prefixed_id("conv");
        assert!(prefixed.starts_with("conv_"));
    }

    #[test]
    fn test_pair_key_is_order_independent() {
        assert_eq!(pair_key("b", "a"), pair_key("a", "b"));
        assert_eq!(group_key(&["z", "m", "a"]), "a|m|z");
        assert_eq!(group_key(&["a", "b"]), pair_key("b", "a"));
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("gateway.local:18789"), "gateway.local_18789");
        assert_eq!(sanitize_key("ws://host/path"), "ws___host_path");
        assert_eq!(sanitize_key("  .. "), "default");
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("hello", 10), "hello");
        assert_eq!(truncate_string("hello world", 8), "hello...");
        assert_eq!(truncate_string("hi", 2), "hi");
        assert_eq!(truncate_string("hi", 1), "...");
        assert_eq!(truncate_string("héllo wörld", 6), "hél...");
    }
}
