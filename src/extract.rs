//! Plain-text extraction: raw upload bytes → decoded [`Document`].
//!
//! Guards run cheapest first: size, binary sniffing on a sampled prefix,
//! decoding, then the character budget.

use serde::Serialize;
use thiserror::Error;

/// Bytes inspected by the binary guard.
pub const BINARY_SAMPLE_BYTES: usize = 20_000;

/// Control-character share above which a file is treated as binary.
pub const MAX_CONTROL_RATIO: f64 = 0.2;

pub const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_TEXT_CHARS: usize = 2_000_000;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("empty file")]
    Empty,

    #[error("file too large: {bytes} bytes (max {max})")]
    TooLarge { bytes: usize, max: usize },

    #[error("binary-like file detected: {0}")]
    BinaryContent(&'static str),

    #[error("failed to decode text with supported encodings (utf-8, cp949)")]
    UndecodableEncoding,

    #[error("text too long: {chars} chars (max {max})")]
    TooManyTextChars { chars: usize, max: usize },
}

impl ExtractionError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Empty | Self::BinaryContent(_) => 400,
            Self::TooLarge { .. } | Self::TooManyTextChars { .. } => 413,
            Self::UndecodableEncoding => 422,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Empty => "empty_file",
            Self::TooLarge { .. } => "file_too_large",
            Self::BinaryContent(_) => "binary_content",
            Self::UndecodableEncoding => "undecodable_encoding",
            Self::TooManyTextChars { .. } => "text_too_long",
        }
    }
}

/// What to do when decoded text exceeds the character budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    #[default]
    Truncate,
    Reject,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    pub max_bytes: usize,
    pub max_text_chars: usize,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
        }
    }
}

/// Decoded upload. Read-only once built.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub text: String,
    pub encoding: &'static str,
    #[serde(rename = "bytes")]
    pub byte_count: usize,
    #[serde(rename = "lines")]
    pub line_count: usize,
    #[serde(skip)]
    pub truncated: bool,
}

impl Document {
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    /// Wrap text that arrived already decoded, clipped to the char budget.
    pub fn from_text(mut text: String, limits: &ExtractLimits) -> Self {
        let byte_count = text.len();
        let mut truncated = false;
        if let Some((idx, _)) = text.char_indices().nth(limits.max_text_chars) {
            text.truncate(idx);
            truncated = true;
        }
        Self {
            line_count: count_lines(&text),
            text,
            encoding: "utf-8",
            byte_count,
            truncated,
        }
    }

    /// Leading `max_chars` characters of the text.
    pub fn clip(&self, max_chars: usize) -> &str {
        match self.text.char_indices().nth(max_chars) {
            Some((idx, _)) => &self.text[..idx],
            None => &self.text,
        }
    }
}

pub fn extract_text(
    raw: &[u8],
    limits: &ExtractLimits,
    policy: OverflowPolicy,
) -> Result<Document, ExtractionError> {
    if raw.is_empty() {
        return Err(ExtractionError::Empty);
    }
    if raw.len() > limits.max_bytes {
        return Err(ExtractionError::TooLarge {
            bytes: raw.len(),
            max: limits.max_bytes,
        });
    }

    binary_guard(raw)?;

    let (mut text, encoding) = decode_with_fallback(raw)?;

    let chars = text.chars().count();
    let mut truncated = false;
    if chars > limits.max_text_chars {
        match policy {
            OverflowPolicy::Reject => {
                return Err(ExtractionError::TooManyTextChars {
                    chars,
                    max: limits.max_text_chars,
                });
            }
            OverflowPolicy::Truncate => {
                if let Some((idx, _)) = text.char_indices().nth(limits.max_text_chars) {
                    text.truncate(idx);
                }
                truncated = true;
            }
        }
    }

    let line_count = count_lines(&text);
    Ok(Document {
        text,
        encoding,
        byte_count: raw.len(),
        line_count,
        truncated,
    })
}

/// Newline count plus one for non-empty text.
pub fn count_lines(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        text.matches('\n').count() + 1
    }
}

/// Reject NUL bytes anywhere, and a high share of control bytes in the
/// sampled prefix. Bytes ≥ 0x80 count as printable (multi-byte text).
pub fn binary_guard(raw: &[u8]) -> Result<(), ExtractionError> {
    if raw.contains(&0) {
        return Err(ExtractionError::BinaryContent("NUL byte found"));
    }

    let sample = &raw[..raw.len().min(BINARY_SAMPLE_BYTES)];
    let control = sample
        .iter()
        .filter(|&&b| (b < 32 && !matches!(b, b'\t' | b'\n' | b'\r')) || b == 127)
        .count();

    if !sample.is_empty() && control as f64 / sample.len() as f64 > MAX_CONTROL_RATIO {
        return Err(ExtractionError::BinaryContent("too many control characters"));
    }
    Ok(())
}

/// UTF-8 (with or without BOM) first, then the Korean legacy code page.
/// encoding_rs's EUC-KR decoder is the windows-949 superset, so it covers
/// both cp949 and plain euc-kr input.
pub fn decode_with_fallback(raw: &[u8]) -> Result<(String, &'static str), ExtractionError> {
    if let Some(rest) = raw.strip_prefix(UTF8_BOM)
        && let Ok(s) = std::str::from_utf8(rest)
    {
        return Ok((s.to_string(), "utf-8-sig"));
    }
    if let Ok(s) = std::str::from_utf8(raw) {
        return Ok((s.to_string(), "utf-8"));
    }
    encoding_rs::EUC_KR
        .decode_without_bom_handling_and_without_replacement(raw)
        .map(|s| (s.into_owned(), "cp949"))
        .ok_or(ExtractionError::UndecodableEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_bytes: usize, max_text_chars: usize) -> ExtractLimits {
        ExtractLimits {
            max_bytes,
            max_text_chars,
        }
    }

    #[test]
    fn empty_input_rejected() {
        let err = extract_text(b"", &ExtractLimits::default(), OverflowPolicy::Truncate);
        assert_eq!(err.unwrap_err(), ExtractionError::Empty);
    }

    #[test]
    fn oversized_input_rejected_before_decoding() {
        let raw = vec![b'a'; 11];
        let err = extract_text(&raw, &limits(10, 100), OverflowPolicy::Truncate).unwrap_err();
        assert_eq!(err, ExtractionError::TooLarge { bytes: 11, max: 10 });
        assert_eq!(err.http_status(), 413);
    }

    #[test]
    fn nul_byte_is_binary() {
        let err = binary_guard(b"hello\0world").unwrap_err();
        assert_eq!(err, ExtractionError::BinaryContent("NUL byte found"));
    }

    #[test]
    fn control_heavy_prefix_is_binary() {
        let mut raw = vec![0x01u8; 30];
        raw.extend_from_slice(b"some text");
        assert!(matches!(
            binary_guard(&raw),
            Err(ExtractionError::BinaryContent(_))
        ));
    }

    #[test]
    fn tabs_and_newlines_are_printable() {
        assert!(binary_guard(b"a\tb\r\nc\n").is_ok());
    }

    #[test]
    fn utf8_bom_is_stripped_and_labelled() {
        let mut raw = UTF8_BOM.to_vec();
        raw.extend_from_slice("안녕하세요".as_bytes());
        let doc = extract_text(&raw, &ExtractLimits::default(), OverflowPolicy::Truncate).unwrap();
        assert_eq!(doc.text, "안녕하세요");
        assert_eq!(doc.encoding, "utf-8-sig");
    }

    #[test]
    fn cp949_fallback_decodes_korean() {
        // "한글" in EUC-KR / CP949
        let raw = [0xC7, 0xD1, 0xB1, 0xDB];
        let (text, enc) = decode_with_fallback(&raw).unwrap();
        assert_eq!(text, "한글");
        assert_eq!(enc, "cp949");
    }

    #[test]
    fn undecodable_bytes_rejected() {
        // 0xFF is invalid as a lead byte in both UTF-8 and EUC-KR.
        let raw = [b'a', 0xFF, 0xFF, b'b'];
        assert_eq!(
            decode_with_fallback(&raw).unwrap_err(),
            ExtractionError::UndecodableEncoding
        );
    }

    #[test]
    fn overflow_truncates_on_char_boundary() {
        let raw = "가나다라마".as_bytes();
        let doc = extract_text(raw, &limits(1024, 3), OverflowPolicy::Truncate).unwrap();
        assert_eq!(doc.text, "가나다");
        assert!(doc.truncated);
        assert_eq!(doc.byte_count, raw.len());
    }

    #[test]
    fn overflow_rejects_when_asked() {
        let err = extract_text(b"abcdef", &limits(1024, 3), OverflowPolicy::Reject).unwrap_err();
        assert_eq!(err, ExtractionError::TooManyTextChars { chars: 6, max: 3 });
    }

    #[test]
    fn line_count_matches_newlines_plus_one() {
        assert_eq!(count_lines(""), 0);
        assert_eq!(count_lines("one"), 1);
        assert_eq!(count_lines("one\ntwo\n"), 3);
    }

    #[test]
    fn from_text_applies_char_budget() {
        let doc = Document::from_text("가나다\n라".to_string(), &limits(1024, 3));
        assert_eq!(doc.text, "가나다");
        assert!(doc.truncated);
        assert_eq!(doc.byte_count, "가나다\n라".len());
        assert_eq!(doc.line_count, 1);

        let doc = Document::from_text("a\nb".to_string(), &ExtractLimits::default());
        assert!(!doc.truncated);
        assert_eq!(doc.line_count, 2);
    }

    #[test]
    fn clip_respects_multibyte_chars() {
        let doc = extract_text(
            "ab가나".as_bytes(),
            &ExtractLimits::default(),
            OverflowPolicy::Truncate,
        )
        .unwrap();
        assert_eq!(doc.clip(3), "ab가");
        assert_eq!(doc.clip(100), "ab가나");
        assert_eq!(doc.char_count(), 4);
    }
}
