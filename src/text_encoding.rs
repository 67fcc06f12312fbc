//! Best-effort re-encoding of tag values to UTF-8.
//!
//! Tags written by old rippers are frequently declared as ISO-8859-1 while
//! actually being Windows-125x or Shift-JIS. Values that already are valid
//! UTF-8 pass through untouched; everything else goes through chardetng
//! detection with a Latin fallback.

/// Decode raw tag bytes into a UTF-8 string.
pub fn decode_tag(bytes: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_owned();
    }

    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);
    let (decoded, _, _) = encoding.decode(bytes);
    decoded.into_owned()
}

/// Fix up a tag string whose bytes may not be what they claim to be.
///
/// Strings that are valid UTF-8 are returned as-is; otherwise the raw bytes
/// are re-detected and re-decoded.
pub fn fixup_string(s: &str) -> String {
    // &str is always valid UTF-8, but tags arrive here after a lossy
    // conversion that may have replaced undecodable bytes. If there are no
    // replacement characters the string is fine.
    if !s.contains('\u{FFFD}') {
        return s.to_owned();
    }
    decode_tag(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn utf8_passes_through() {
        assert_eq!(decode_tag("Röyksopp".as_bytes()), "Röyksopp");
    }

    #[test]
    fn latin1_is_detected() {
        // "café" with e-acute as a single 0xE9 byte
        let result = decode_tag(b"caf\xe9");
        assert!(result.starts_with("caf"));
        assert!(result.contains('\u{00e9}'));
    }

    #[test]
    fn shift_jis_is_detected() {
        let (encoded, _, _) = encoding_rs::SHIFT_JIS.encode("テスト");
        assert_eq!(decode_tag(&encoded), "テスト");
    }
}
