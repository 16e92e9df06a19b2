//! Utility functions for ringkv

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::time::{SystemTime, UNIX_EPOCH};

/// Percent-encoding set for node names (includes /, %, and control chars)
const SEGMENT_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&');

/// Encode a name so it can be used as a single path segment
pub fn encode_segment(name: &str) -> String {
    utf8_percent_encode(name, SEGMENT_ENCODE_SET).to_string()
}

/// Decode a percent-encoded path segment
pub fn decode_segment(encoded: &str) -> crate::Result<String> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|s| s.to_string())
        .map_err(|e| crate::Error::MetadataCorrupted(format!("Failed to decode segment: {}", e)))
}

/// Hex rendering of a key for log lines
pub fn key_to_hex(key: &[u8]) -> String {
    hex::encode(key)
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Render a millisecond timestamp as RFC 3339
pub fn format_timestamp_millis(millis: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(millis as i64)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

/// Split a comma-separated flag list, dropping blanks and sorting
pub fn split_flags(flags: &str) -> Vec<String> {
    let mut result: Vec<String> = flags
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect();
    result.sort();
    result.dedup();
    result
}

/// Join flags into their canonical comma-separated form
pub fn join_flags(flags: &[String]) -> String {
    let mut sorted = flags.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_segment() {
        let name = "host-1.example.com:12345";
        assert_eq!(encode_segment(name), name);

        let odd = "a/b c";
        let encoded = encode_segment(odd);
        assert!(!encoded.contains('/'));
        assert_eq!(decode_segment(&encoded).unwrap(), odd);
    }

    #[test]
    fn test_key_to_hex() {
        assert_eq!(key_to_hex(&[0x01, 0xab]), "01ab");
        assert_eq!(key_to_hex(b""), "");
    }

    #[test]
    fn test_flags() {
        assert_eq!(split_flags("b, a,,c,a"), vec!["a", "b", "c"]);
        assert!(split_flags("").is_empty());
        assert_eq!(join_flags(&["z".into(), "a".into()]), "a,z");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp_millis(0), "1970-01-01T00:00:00+00:00");
    }
}
