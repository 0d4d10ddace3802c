//! Line decoder for CLEF log envelopes.
//!
//! Archived container logs wrap every event in a JSON envelope whose `log`
//! field holds the raw CLEF line. Anything else found in a member (plain-text
//! output, truncated JSON, envelopes of the wrong shape) is noise and is
//! skipped without error.

use serde_json::{Map, Value};

/// Envelope field holding the message to ship.
pub const LOG_FIELD: &str = "log";

/// CLEF timestamp field, optionally required as a validity marker.
pub const TIMESTAMP_FIELD: &str = "@t";

/// Extracts shippable payloads from envelope lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineDecoder {
    require_timestamp: bool,
}

impl LineDecoder {
    pub fn new(require_timestamp: bool) -> Self {
        Self { require_timestamp }
    }

    pub fn require_timestamp(&self) -> bool {
        self.require_timestamp
    }

    /// Decode one line into its `log` payload.
    ///
    /// Returns `None` for every line that does not carry a string `log`
    /// field (and an `@t` field, when required).
    pub fn decode(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }

        let mut envelope: Map<String, Value> = serde_json::from_str(line).ok()?;
        if self.require_timestamp && !envelope.contains_key(TIMESTAMP_FIELD) {
            return None;
        }

        match envelope.remove(LOG_FIELD)? {
            Value::String(log) => Some(log),
            _ => None,
        }
    }

    /// Decode a raw line; invalid UTF-8 counts as noise.
    pub fn decode_bytes(&self, line: &[u8]) -> Option<String> {
        std::str::from_utf8(line).ok().and_then(|l| self.decode(l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_log_field() {
        let decoder = LineDecoder::default();
        assert_eq!(decoder.decode(r#"{"log":"a"}"#), Some("a".to_string()));
        assert_eq!(
            decoder.decode(r#"  {"stream":"stdout","log":"{\"@t\":\"x\"}\n"}  "#),
            Some("{\"@t\":\"x\"}\n".to_string())
        );
    }

    #[test]
    fn test_non_json_is_noise() {
        let decoder = LineDecoder::default();
        assert_eq!(decoder.decode("not json"), None);
        assert_eq!(decoder.decode(""), None);
        assert_eq!(decoder.decode("   "), None);
        assert_eq!(decoder.decode(r#"["log","a"]"#), None);
    }

    #[test]
    fn test_malformed_json_is_noise() {
        let decoder = LineDecoder::default();
        assert_eq!(decoder.decode(r#"{"log":"a""#), None);
        assert_eq!(decoder.decode("{not json at all}"), None);
    }

    #[test]
    fn test_missing_log_field() {
        let decoder = LineDecoder::default();
        assert_eq!(decoder.decode(r#"{"msg":"a"}"#), None);
    }

    #[test]
    fn test_non_string_log_is_noise() {
        let decoder = LineDecoder::default();
        assert_eq!(decoder.decode(r#"{"log":42}"#), None);
        assert_eq!(decoder.decode(r#"{"log":null}"#), None);
        assert_eq!(decoder.decode(r#"{"log":{"nested":"a"}}"#), None);
    }

    #[test]
    fn test_timestamp_requirement() {
        let strict = LineDecoder::new(true);
        assert_eq!(strict.decode(r#"{"log":"a"}"#), None);
        assert_eq!(
            strict.decode(r#"{"log":"b","@t":"2024-01-01"}"#),
            Some("b".to_string())
        );

        let lenient = LineDecoder::new(false);
        assert_eq!(lenient.decode(r#"{"log":"a"}"#), Some("a".to_string()));
    }

    #[test]
    fn test_decode_bytes_rejects_invalid_utf8() {
        let decoder = LineDecoder::default();
        assert_eq!(decoder.decode_bytes(b"{\"log\":\"\xff\"}"), None);
        assert_eq!(decoder.decode_bytes(br#"{"log":"ok"}"#), Some("ok".to_string()));
    }
}
