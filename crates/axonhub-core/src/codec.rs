//! Signature/marker codec (C6).
//!
//! Gemini "thought signatures" and OpenAI "encrypted reasoning" have no
//! slot in other dialects. When such a value has to ride through a foreign
//! dialect it is prefixed with a deterministic base64-encoded sentinel and
//! stashed in an opaque field (an Anthropic `redacted_thinking.data`, an
//! OpenAI reasoning string). The prefix test on the return leg tells a
//! wrapped foreign payload apart from a value native to the dialect.

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

static GEMINI_SIGNATURE_PREFIX: LazyLock<String> =
    LazyLock::new(|| BASE64.encode("<GEMINI_THOUGHT_SIGNATURE>"));
static OPENAI_REASONING_PREFIX: LazyLock<String> =
    LazyLock::new(|| BASE64.encode("<OPENAI_ENCRYPTED_CONTENT>"));

fn is_prefixed(value: Option<&str>, prefix: &str) -> bool {
    value.is_some_and(|value| value.starts_with(prefix))
}

fn encode(value: Option<&str>, prefix: &str) -> Option<String> {
    value.map(|value| format!("{prefix}{value}"))
}

fn decode(value: Option<&str>, prefix: &str) -> Option<String> {
    value?.strip_prefix(prefix).map(str::to_owned)
}

pub fn is_gemini_signature(value: Option<&str>) -> bool {
    is_prefixed(value, &GEMINI_SIGNATURE_PREFIX)
}

pub fn encode_gemini_signature(value: Option<&str>) -> Option<String> {
    encode(value, &GEMINI_SIGNATURE_PREFIX)
}

pub fn decode_gemini_signature(value: Option<&str>) -> Option<String> {
    decode(value, &GEMINI_SIGNATURE_PREFIX)
}

pub fn is_openai_encrypted(value: Option<&str>) -> bool {
    is_prefixed(value, &OPENAI_REASONING_PREFIX)
}

pub fn encode_openai_encrypted(value: Option<&str>) -> Option<String> {
    encode(value, &OPENAI_REASONING_PREFIX)
}

pub fn decode_openai_encrypted(value: Option<&str>) -> Option<String> {
    decode(value, &OPENAI_REASONING_PREFIX)
}

/// A redacted-thinking payload carrying neither marker belongs to the
/// dialect that produced it and must pass through untouched.
pub fn is_native_redacted(data: &str) -> bool {
    !is_gemini_signature(Some(data)) && !is_openai_encrypted(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let payload = "sig-bytes-123";
        let wrapped = encode_gemini_signature(Some(payload)).unwrap();
        assert!(is_gemini_signature(Some(&wrapped)));
        assert_eq!(decode_gemini_signature(Some(&wrapped)).as_deref(), Some(payload));

        let wrapped = encode_openai_encrypted(Some(payload)).unwrap();
        assert!(is_openai_encrypted(Some(&wrapped)));
        assert_eq!(decode_openai_encrypted(Some(&wrapped)).as_deref(), Some(payload));
    }

    #[test]
    fn test_nil_in_nil_out() {
        assert_eq!(encode_gemini_signature(None), None);
        assert_eq!(decode_gemini_signature(None), None);
        assert!(!is_gemini_signature(None));
    }

    #[test]
    fn test_decode_without_prefix_is_none() {
        assert_eq!(decode_gemini_signature(Some("plain")), None);
        assert_eq!(decode_openai_encrypted(Some("plain")), None);
    }

    #[test]
    fn test_markers_are_disjoint_and_native_detection() {
        let gemini = encode_gemini_signature(Some("x")).unwrap();
        let openai = encode_openai_encrypted(Some("x")).unwrap();
        assert!(!is_openai_encrypted(Some(&gemini)));
        assert!(!is_gemini_signature(Some(&openai)));
        assert!(!is_native_redacted(&gemini));
        assert!(!is_native_redacted(&openai));
        assert!(is_native_redacted("EqQBCgIYAhgB"));
    }
}
