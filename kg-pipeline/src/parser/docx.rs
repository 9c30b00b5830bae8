use std::io::{Cursor, Read};
use std::path::Path;

use common::error::ParseError;
use quick_xml::events::Event;
use quick_xml::Reader;

/// DOCX is a zip container; the document body lives in `word/document.xml`.
/// Non-empty paragraphs are concatenated, tables become tab-joined rows
/// between explicit boundary markers.
pub async fn parse_docx(path: &Path) -> Result<String, ParseError> {
    let display = path.display().to_string();
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| ParseError::Corrupt(format!("{display}: {err}")))?;

    tokio::task::spawn_blocking(move || extract_document(&bytes, &display))
        .await
        .map_err(|err| ParseError::Corrupt(err.to_string()))?
}

fn extract_document(bytes: &[u8], display: &str) -> Result<String, ParseError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| ParseError::Corrupt(format!("{display}: {err}")))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|_| ParseError::Corrupt(format!("{display}: missing word/document.xml")))?
        .read_to_string(&mut xml)
        .map_err(|err| ParseError::Corrupt(format!("{display}: {err}")))?;

    let content = walk_body(&xml, display)?;
    if content.is_empty() {
        return Err(ParseError::EmptyExtraction(display.to_string()));
    }

    Ok(content.join("\n"))
}

fn walk_body(xml: &str, display: &str) -> Result<Vec<String>, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut content: Vec<String> = Vec::new();
    let mut paragraph = String::new();
    let mut cell = String::new();
    let mut row_cells: Vec<String> = Vec::new();
    let mut table_depth = 0usize;
    let mut in_text_run = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"w:tbl" => {
                    content.push("=== Table ===".to_string());
                    table_depth += 1;
                }
                b"w:tc" => cell.clear(),
                b"w:p" if table_depth == 0 => paragraph.clear(),
                b"w:t" => in_text_run = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    content.push("=== End table ===".to_string());
                }
                b"w:tc" => {
                    let trimmed = cell.trim();
                    if !trimmed.is_empty() {
                        row_cells.push(trimmed.to_string());
                    }
                }
                b"w:tr" => {
                    if !row_cells.is_empty() {
                        content.push(row_cells.join("\t"));
                        row_cells.clear();
                    }
                }
                b"w:p" => {
                    if table_depth == 0 {
                        let trimmed = paragraph.trim();
                        if !trimmed.is_empty() {
                            content.push(trimmed.to_string());
                        }
                    } else {
                        cell.push(' ');
                    }
                }
                b"w:t" => in_text_run = false,
                _ => {}
            },
            Ok(Event::Text(t)) if in_text_run => {
                let text = t
                    .unescape()
                    .map_err(|err| ParseError::Corrupt(format!("{display}: {err}")))?;
                if table_depth > 0 {
                    cell.push_str(&text);
                } else {
                    paragraph.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(ParseError::Corrupt(format!("{display}: {err}"))),
            _ => {}
        }
    }

    Ok(content)
}
