use std::io::{Cursor, Read};
use std::path::Path;

use common::error::ParseError;
use quick_xml::events::Event;
use quick_xml::Reader;

/// Rows emitted per sheet before the truncation marker: one header line
/// plus at most 100 data rows.
const MAX_ROWS_PER_SHEET: usize = 101;

/// XLSX extraction: per sheet, rows are tab-joined and capped, with shared
/// strings resolved from the workbook's string table.
pub async fn parse_xlsx(path: &Path) -> Result<String, ParseError> {
    let display = path.display().to_string();
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| ParseError::Corrupt(format!("{display}: {err}")))?;

    tokio::task::spawn_blocking(move || extract_workbook(&bytes, &display))
        .await
        .map_err(|err| ParseError::Corrupt(err.to_string()))?
}

fn extract_workbook(bytes: &[u8], display: &str) -> Result<String, ParseError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| ParseError::Corrupt(format!("{display}: {err}")))?;

    let shared = match read_entry(&mut archive, "xl/sharedStrings.xml") {
        Some(xml) => parse_shared_strings(&xml, display)?,
        None => Vec::new(),
    };
    let sheet_names = match read_entry(&mut archive, "xl/workbook.xml") {
        Some(xml) => parse_sheet_names(&xml, display)?,
        None => Vec::new(),
    };

    let mut content: Vec<String> = Vec::new();
    for index in 1.. {
        let Some(xml) = read_entry(&mut archive, &format!("xl/worksheets/sheet{index}.xml"))
        else {
            break;
        };
        let name = sheet_names
            .get(index - 1)
            .cloned()
            .unwrap_or_else(|| format!("Sheet{index}"));
        content.push(format!("=== Sheet: {name} ==="));
        content.extend(parse_sheet_rows(&xml, &shared, display)?);
    }

    if content.iter().all(|line| line.starts_with("=== Sheet:")) {
        return Err(ParseError::EmptyExtraction(display.to_string()));
    }

    Ok(content.join("\n"))
}

fn read_entry(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> Option<String> {
    let mut entry = archive.by_name(name).ok()?;
    let mut xml = String::new();
    entry.read_to_string(&mut xml).ok()?;
    Some(xml)
}

fn parse_shared_strings(xml: &str, display: &str) -> Result<Vec<String>, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_item = false;
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"si" => {
                    in_item = true;
                    current.clear();
                }
                b"t" if in_item => in_text = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"si" => {
                    in_item = false;
                    strings.push(current.clone());
                }
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                current.push_str(
                    &t.unescape()
                        .map_err(|err| ParseError::Corrupt(format!("{display}: {err}")))?,
                );
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(ParseError::Corrupt(format!("{display}: {err}"))),
            _ => {}
        }
    }

    Ok(strings)
}

fn parse_sheet_names(xml: &str, display: &str) -> Result<Vec<String>, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut names = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) if e.name().as_ref() == b"sheet" => {
                if let Ok(Some(attr)) = e.try_get_attribute("name") {
                    let value = attr
                        .unescape_value()
                        .map_err(|err| ParseError::Corrupt(format!("{display}: {err}")))?;
                    names.push(value.into_owned());
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(ParseError::Corrupt(format!("{display}: {err}"))),
            _ => {}
        }
    }

    Ok(names)
}

fn parse_sheet_rows(
    xml: &str,
    shared: &[String],
    display: &str,
) -> Result<Vec<String>, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut rows: Vec<String> = Vec::new();
    let mut row_cells: Vec<String> = Vec::new();
    let mut cell_type: Option<String> = None;
    let mut in_value = false;
    let mut in_inline_text = false;
    let mut truncated = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"row" => row_cells.clear(),
                b"c" => {
                    cell_type = match e.try_get_attribute("t") {
                        Ok(Some(attr)) => attr.unescape_value().ok().map(|v| v.into_owned()),
                        _ => None,
                    };
                }
                b"v" => in_value = true,
                b"t" if cell_type.as_deref() == Some("inlineStr") => in_inline_text = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"row" => {
                    if !row_cells.is_empty() && !truncated {
                        if rows.len() >= MAX_ROWS_PER_SHEET {
                            rows.push("... truncated ...".to_string());
                            truncated = true;
                        } else {
                            rows.push(row_cells.join("\t"));
                        }
                    }
                    row_cells.clear();
                }
                b"v" => in_value = false,
                b"t" => in_inline_text = false,
                _ => {}
            },
            Ok(Event::Text(t)) if in_value || in_inline_text => {
                let raw = t
                    .unescape()
                    .map_err(|err| ParseError::Corrupt(format!("{display}: {err}")))?;
                let resolved = if in_value && cell_type.as_deref() == Some("s") {
                    raw.trim()
                        .parse::<usize>()
                        .ok()
                        .and_then(|idx| shared.get(idx).cloned())
                        .unwrap_or_default()
                } else {
                    raw.into_owned()
                };
                let resolved = resolved.trim().to_string();
                if !resolved.is_empty() {
                    row_cells.push(resolved);
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(ParseError::Corrupt(format!("{display}: {err}"))),
            _ => {}
        }
    }

    Ok(rows)
}
