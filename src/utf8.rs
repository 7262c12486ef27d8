//! UTF-8 validation for text payloads
//!
//! Wraps `simdutf8`, which picks the fastest implementation the target CPU
//! supports and falls back to the standard library elsewhere.

/// Validate that `data` is well-formed UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_sequences() {
        assert!(validate_utf8(b""));
        assert!(validate_utf8(b"hello"));
        assert!(validate_utf8("héllo wörld".as_bytes()));
        assert!(validate_utf8("日本語テキスト".as_bytes()));
        assert!(validate_utf8("🦀🦀🦀".as_bytes()));
    }

    #[test]
    fn test_invalid_sequences() {
        assert!(!validate_utf8(&[0xFF]));
        assert!(!validate_utf8(&[0xC0, 0x80])); // overlong NUL
        assert!(!validate_utf8(&[0xED, 0xA0, 0x80])); // UTF-16 surrogate
        assert!(!validate_utf8(b"ok so far \xE2\x82")); // truncated sequence
    }
}
