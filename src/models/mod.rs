//! Data model shared by the request pipeline, the stores and the detector.

pub mod entries;
pub mod request;

pub use entries::{BlockedEntry, SuspiciousEntry};
pub use request::{Decision, RequestMeta, RequestRecord};

/// Maximum stored length of a request path.
pub const MAX_PATH_LEN: usize = 500;

/// Maximum stored length of a country or city name.
pub const MAX_LOCATION_LEN: usize = 100;

/// Truncate a string to at most `max_chars` characters.
pub(crate) fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("abc", 10), "abc");
        // Multi-byte characters are never split
        assert_eq!(truncate_chars("zürich", 2), "zü");
    }
}
