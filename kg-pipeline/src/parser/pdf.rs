use std::path::Path;

use common::error::ParseError;
use lopdf::content::Content;
use lopdf::{Document, Object, ObjectId};
use tracing::{debug, warn};

/// PDF extraction: layout-aware whole-document extraction first, falling
/// back to per-page extraction, and per page to raw character recovery
/// from the content streams when the text layer comes back empty.
pub async fn parse_pdf(path: &Path) -> Result<String, ParseError> {
    let display = path.display().to_string();
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| ParseError::Corrupt(format!("{display}: {err}")))?;

    let fast = {
        let bytes = bytes.clone();
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|err| ParseError::Corrupt(format!("{display}: {err}")))?
    };

    match fast {
        Ok(text) if !text.trim().is_empty() => {
            debug!(path = %path.display(), "pdf text layer extracted");
            return Ok(text);
        }
        Ok(_) => warn!(path = %path.display(), "pdf text layer empty, reading per page"),
        Err(err) => warn!(path = %path.display(), %err, "pdf text layer failed, reading per page"),
    }

    let display = path.display().to_string();
    tokio::task::spawn_blocking(move || extract_per_page(&bytes, &display))
        .await
        .map_err(|err| ParseError::Corrupt(err.to_string()))?
}

fn extract_per_page(bytes: &[u8], display: &str) -> Result<String, ParseError> {
    let document = Document::load_mem(bytes)
        .map_err(|err| ParseError::Corrupt(format!("{display}: {err}")))?;

    let mut content = Vec::new();
    for (page, page_id) in document.get_pages() {
        let text = match document.extract_text(&[page]) {
            Ok(text) => text,
            Err(err) => {
                warn!(page, %err, "pdf page extraction failed");
                String::new()
            }
        };

        if !text.trim().is_empty() {
            content.push(format!("=== Page {page} ==="));
            content.push(text);
            continue;
        }

        match page_chars(&document, page_id) {
            Some(chars) if !chars.trim().is_empty() => {
                content.push(format!("=== Page {page} (char mode) ==="));
                content.push(chars);
            }
            _ => warn!(page, "pdf page produced no text"),
        }
    }

    if content.is_empty() {
        return Err(ParseError::EmptyExtraction(display.to_string()));
    }

    Ok(content.join("\n"))
}

/// Last-resort recovery for a page without an extractable text layer:
/// string operands of the text-showing operators, in stream order.
fn page_chars(document: &Document, page_id: ObjectId) -> Option<String> {
    let data = document.get_page_content(page_id).ok()?;
    let operations = Content::decode(&data).ok()?.operations;

    let mut chars = String::new();
    for operation in operations {
        match operation.operator.as_str() {
            "Tj" | "'" | "\"" => {
                for operand in &operation.operands {
                    if let Object::String(bytes, _) = operand {
                        chars.push_str(&String::from_utf8_lossy(bytes));
                    }
                }
            }
            "TJ" => {
                for operand in &operation.operands {
                    if let Object::Array(items) = operand {
                        for item in items {
                            if let Object::String(bytes, _) = item {
                                chars.push_str(&String::from_utf8_lossy(bytes));
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    (!chars.is_empty()).then_some(chars)
}
