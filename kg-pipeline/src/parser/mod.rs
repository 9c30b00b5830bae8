mod docx;
mod pdf;
mod text;
mod xlsx;

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use common::error::ParseError;
use regex::Regex;
use tracing::{debug, info, warn};

/// Substrings that make a text worth feeding into extraction.
static MEANINGFUL: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"[\x{4e00}-\x{9fa5}a-zA-Z0-9]{2,}").unwrap()
});

static PUNCTUATION: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"[^\w\s]").unwrap()
});

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\s+").unwrap()
});

static BROKEN_WORD: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(\w+)-\s+(\w+)").unwrap()
});

/// Extensions probed when a listed file id does not exist at its expected
/// path. First hit wins; parse-stage self-healing only.
const PROBE_EXTENSIONS: &[&str] = &["pdf", "txt", "docx", "xlsx"];

/// Extracts plain text from a single uploaded file by format.
pub struct FileParser;

impl FileParser {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a file id under the upload directory, probing well-known
    /// extensions when the verbatim path is missing.
    pub async fn resolve_path(&self, upload_dir: &Path, file_id: &str) -> Option<PathBuf> {
        let path = upload_dir.join(file_id);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Some(path);
        }

        for ext in PROBE_EXTENSIONS {
            let candidate = path.with_extension(ext);
            if tokio::fs::metadata(&candidate).await.is_ok() {
                warn!(file_id, candidate = %candidate.display(), "healed missing upload path");
                return Some(candidate);
            }
        }

        None
    }

    /// Parse a file, inferring the format from its extension. Passing
    /// `Some("auto")` forces content sniffing instead.
    pub async fn parse(&self, path: &Path, format: Option<&str>) -> Result<String, ParseError> {
        let display_path = path.display().to_string();
        if tokio::fs::metadata(path).await.is_err() {
            return Err(ParseError::FileMissing(display_path));
        }

        let extension = match format {
            // "auto" skips extension dispatch and sniffs the content
            Some(explicit) => explicit.to_ascii_lowercase(),
            None => path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_ascii_lowercase(),
        };

        info!(path = %display_path, %extension, "parsing file");

        let raw = match extension.as_str() {
            "txt" | "text" => text::parse_text(path).await?,
            "pdf" => pdf::parse_pdf(path).await?,
            "docx" => docx::parse_docx(path).await?,
            "doc" => {
                return Err(ParseError::FormatUnsupported(
                    "legacy .doc is not supported, convert to .docx".to_string(),
                ))
            }
            "xlsx" | "xls" => xlsx::parse_xlsx(path).await?,
            _ => text::parse_text_sniffed(path).await?,
        };

        let cleaned = clean_text(&raw);
        if cleaned.is_empty() {
            return Err(ParseError::EmptyExtraction(display_path));
        }
        if !is_meaningful(&cleaned) {
            return Err(ParseError::NotMeaningful(display_path));
        }

        debug!(path = %display_path, chars = cleaned.chars().count(), "file parsed");
        Ok(cleaned)
    }
}

impl Default for FileParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Whitespace runs collapse to one space, runs of the same punctuation
/// character collapse to one, and hyphenated word fragments are rejoined.
pub fn clean_text(text: &str) -> String {
    let text = WHITESPACE_RUN.replace_all(text, " ");
    let text = collapse_identical_punctuation(&text);
    let text = BROKEN_WORD.replace_all(&text, "$1$2");
    text.trim().to_string()
}

fn collapse_identical_punctuation(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous: Option<char> = None;
    for ch in text.chars() {
        let is_punct = !ch.is_alphanumeric() && !ch.is_whitespace() && ch != '_';
        if is_punct && previous == Some(ch) {
            continue;
        }
        previous = Some(ch);
        out.push(ch);
    }
    out
}

/// The gate that keeps binary soup and scan noise out of the pipeline:
/// at least 100 characters, at least 10 alphanumeric/CJK substrings of
/// length >= 2, and a punctuation share of at most 30%.
pub fn is_meaningful(text: &str) -> bool {
    let char_count = text.chars().count();
    if char_count < 100 {
        return false;
    }

    if MEANINGFUL.find_iter(text).count() < 10 {
        return false;
    }

    let punctuation = PUNCTUATION.find_iter(text).count();
    #[allow(clippy::cast_precision_loss)]
    let ratio = punctuation as f64 / char_count.max(1) as f64;
    ratio <= 0.3
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn meaningful_body() -> String {
        "知识图谱 construction pipelines ingest documents and emit graphs. "
            .repeat(4)
    }

    #[test]
    fn clean_text_collapses_whitespace_and_punctuation() {
        assert_eq!(clean_text("a   b\n\nc"), "a b c");
        assert_eq!(clean_text("wow!!! ok??"), "wow! ok?");
        assert_eq!(clean_text("Goo- gle built it"), "Google built it");
        assert_eq!(clean_text("  trimmed  "), "trimmed");
    }

    #[test]
    fn clean_text_keeps_distinct_punctuation() {
        assert_eq!(clean_text("a!?b"), "a!?b");
    }

    #[test]
    fn meaningful_gate_rejects_short_and_noisy_text() {
        assert!(!is_meaningful("too short"));
        assert!(!is_meaningful(&"!@#$%^&*() ".repeat(20)));
        assert!(is_meaningful(&meaningful_body()));
    }

    #[tokio::test]
    async fn parse_missing_file_errors() {
        let parser = FileParser::new();
        let err = parser
            .parse(Path::new("/definitely/not/here.txt"), None)
            .await
            .expect_err("missing file must error");
        assert!(matches!(err, ParseError::FileMissing(_)));
    }

    #[tokio::test]
    async fn parse_rejects_legacy_doc() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("old.doc");
        std::fs::write(&path, b"whatever").expect("write");

        let parser = FileParser::new();
        let err = parser.parse(&path, None).await.expect_err("doc unsupported");
        assert!(matches!(err, ParseError::FormatUnsupported(_)));
    }

    #[tokio::test]
    async fn parse_plain_text_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("note.txt");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(meaningful_body().as_bytes()).expect("write");

        let parser = FileParser::new();
        let parsed = parser.parse(&path, None).await.expect("parse text");
        assert!(parsed.contains("知识图谱"));
    }

    #[tokio::test]
    async fn resolve_path_probes_known_extensions() {
        let dir = TempDir::new().expect("tempdir");
        let actual = dir.path().join("upload-1.txt");
        std::fs::write(&actual, b"data").expect("write");

        let parser = FileParser::new();
        let resolved = parser
            .resolve_path(dir.path(), "upload-1")
            .await
            .expect("probe should find .txt");
        assert_eq!(resolved, actual);

        assert!(parser.resolve_path(dir.path(), "upload-2").await.is_none());
    }

    #[tokio::test]
    async fn parse_unmeaningful_text_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("tiny.txt");
        std::fs::write(&path, b"hi").expect("write");

        let parser = FileParser::new();
        let err = parser.parse(&path, None).await.expect_err("tiny text rejected");
        assert!(matches!(err, ParseError::NotMeaningful(_)));
    }
}
