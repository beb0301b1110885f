//! Shared utility helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a short random id with the given prefix, e.g. `job_3f9a0c1b2d4e`.
pub fn short_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &raw[..12])
}

/// Truncate a string to `max` bytes, appending `…` if trimmed.
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Turn an arbitrary key into something safe to use as a file stem.
pub fn sanitize_file_stem(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_has_prefix_and_length() {
        let id = short_id("job");
        assert!(id.starts_with("job_"));
        assert_eq!(id.len(), "job_".len() + 12);
        assert_ne!(id, short_id("job"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("héllo", 2), "h…");
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(
            sanitize_file_stem("agent:main:discord:dm:42"),
            "agent_main_discord_dm_42"
        );
    }
}
