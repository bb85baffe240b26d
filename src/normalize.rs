use std::io::{Cursor, Read as _};
use std::path::Path;

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use quick_xml::events::Event as XmlEvent;

use crate::error::IngestionError;
use crate::formats::{FormatTag, NormalizedText, SourceDocument};

/// Converts a source document into plain text with paragraph structure.
///
/// A document whose extraction yields no non-whitespace text is a
/// `ParseFailure`, never an empty success.
pub fn normalize(doc: &SourceDocument) -> Result<NormalizedText, IngestionError> {
    let Some(format) = doc.format else {
        return Err(IngestionError::UnsupportedFormat {
            path: doc.path.clone(),
        });
    };

    let normalized = match format {
        FormatTag::Text => NormalizedText::from_plain(&decode_utf8(&doc.path, &doc.bytes)?),
        FormatTag::Markdown => normalize_markdown(&decode_utf8(&doc.path, &doc.bytes)?),
        FormatTag::Csv => normalize_csv(&doc.path, &doc.bytes)?,
        FormatTag::Json => normalize_json(&doc.path, &doc.bytes)?,
        FormatTag::Docx => normalize_docx(&doc.path, &doc.bytes)?,
        FormatTag::Pdf => normalize_pdf(&doc.path, &doc.bytes)?,
    };

    if normalized.is_blank() {
        return Err(IngestionError::parse(
            &doc.path,
            format!("{format} document contains no extractable text"),
        ));
    }

    tracing::debug!(
        path = %doc.path.display(),
        format = %format,
        paragraphs = normalized.paragraph_ranges().len(),
        sections = normalized.sections().len(),
        "normalized document"
    );
    Ok(normalized)
}

fn decode_utf8(path: &Path, bytes: &[u8]) -> Result<String, IngestionError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| IngestionError::parse(path, format!("text is not valid UTF-8: {err}")))?;
    Ok(text.trim_start_matches('\u{feff}').to_owned())
}

fn normalize_markdown(input: &str) -> NormalizedText {
    let options = Options::ENABLE_TABLES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
        | Options::ENABLE_YAML_STYLE_METADATA_BLOCKS;

    let mut builder = NormalizedText::builder();
    let mut current = String::new();
    let mut in_metadata = false;

    for event in Parser::new_ext(input, options) {
        match event {
            Event::Start(Tag::MetadataBlock(_)) => in_metadata = true,
            Event::End(TagEnd::MetadataBlock(_)) => in_metadata = false,
            Event::Start(Tag::Heading { .. }) => {
                builder.push_paragraph(&current);
                current.clear();
                builder.start_section();
            }
            Event::End(
                TagEnd::Heading(_)
                | TagEnd::Paragraph
                | TagEnd::Item
                | TagEnd::CodeBlock
                | TagEnd::TableHead
                | TagEnd::TableRow
                | TagEnd::BlockQuote(_),
            ) => {
                builder.push_paragraph(&current);
                current.clear();
            }
            Event::End(TagEnd::TableCell) => current.push_str(" | "),
            Event::Text(text) | Event::Code(text) if !in_metadata => current.push_str(&text),
            Event::SoftBreak => current.push(' '),
            Event::HardBreak => current.push('\n'),
            _ => {}
        }
    }
    builder.push_paragraph(&current);
    builder.finish()
}

fn normalize_csv(path: &Path, bytes: &[u8]) -> Result<NormalizedText, IngestionError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|err| IngestionError::parse(path, format!("read csv header: {err}")))?
        .clone();

    let mut builder = NormalizedText::builder();
    for (row, record) in reader.records().enumerate() {
        let record = record
            .map_err(|err| IngestionError::parse(path, format!("read csv row {}: {err}", row + 1)))?;

        let lines = record
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(col, value)| {
                let label = headers
                    .get(col)
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("column {}", col + 1));
                format!("{label}: {}", value.trim())
            })
            .collect::<Vec<_>>();
        builder.push_paragraph(&lines.join("\n"));
    }
    Ok(builder.finish())
}

fn normalize_json(path: &Path, bytes: &[u8]) -> Result<NormalizedText, IngestionError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|err| IngestionError::parse(path, format!("parse json: {err}")))?;

    let mut builder = NormalizedText::builder();
    match &value {
        serde_json::Value::Array(items) => {
            for item in items {
                builder.push_paragraph(&flatten_json_record(item));
            }
        }
        serde_json::Value::Object(map) => {
            let mut header = Vec::new();
            for (key, value) in map {
                match value {
                    serde_json::Value::Array(items) if items.iter().any(|v| v.is_object()) => {
                        builder.start_section();
                        builder.push_paragraph(key);
                        for item in items {
                            builder.push_paragraph(&flatten_json_record(item));
                        }
                    }
                    _ => flatten_json_into(key, value, &mut header),
                }
            }
            if !header.is_empty() {
                builder.start_section();
                builder.push_paragraph(&header.join("\n"));
            }
        }
        scalar => builder.push_paragraph(&json_scalar_text(scalar)),
    }
    Ok(builder.finish())
}

fn flatten_json_record(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut lines = Vec::new();
            for (key, value) in map {
                flatten_json_into(key, value, &mut lines);
            }
            lines.join("\n")
        }
        serde_json::Value::Array(_) => {
            let mut lines = Vec::new();
            flatten_json_into("items", value, &mut lines);
            lines.join("\n")
        }
        scalar => json_scalar_text(scalar),
    }
}

/// Emits `label: value` lines, joining nested object keys with dots.
fn flatten_json_into(label: &str, value: &serde_json::Value, lines: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                flatten_json_into(&format!("{label}.{key}"), nested, lines);
            }
        }
        serde_json::Value::Array(items) if items.iter().all(|v| !v.is_object() && !v.is_array()) => {
            let joined = items
                .iter()
                .map(json_scalar_text)
                .filter(|s| !s.trim().is_empty())
                .collect::<Vec<_>>()
                .join(", ");
            if !joined.is_empty() {
                lines.push(format!("{label}: {joined}"));
            }
        }
        serde_json::Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                flatten_json_into(&format!("{label}[{idx}]"), item, lines);
            }
        }
        serde_json::Value::Null => {}
        scalar => {
            let text = json_scalar_text(scalar);
            if !text.trim().is_empty() {
                lines.push(format!("{label}: {text}"));
            }
        }
    }
}

fn json_scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn normalize_docx(path: &Path, bytes: &[u8]) -> Result<NormalizedText, IngestionError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| IngestionError::parse(path, format!("open docx archive: {err}")))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|err| IngestionError::parse(path, format!("find word/document.xml: {err}")))?
        .read_to_string(&mut xml)
        .map_err(|err| IngestionError::parse(path, format!("read word/document.xml: {err}")))?;

    let mut reader = quick_xml::Reader::from_str(&xml);
    reader.config_mut().trim_text(false);

    let mut builder = NormalizedText::builder();
    let mut current = String::new();
    let mut in_text = false;
    let mut heading = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| IngestionError::parse(path, format!("parse document.xml: {err}")))?;
        match event {
            XmlEvent::Start(e) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"p" => {
                    current.clear();
                    heading = false;
                }
                _ => {}
            },
            XmlEvent::Empty(e) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                b"pStyle" => {
                    let style = e
                        .try_get_attribute("w:val")
                        .ok()
                        .flatten()
                        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
                        .unwrap_or_default();
                    heading = style.starts_with("Heading") || style == "Title";
                }
                _ => {}
            },
            XmlEvent::Text(text) if in_text => {
                let text = text
                    .unescape()
                    .map_err(|err| IngestionError::parse(path, format!("decode docx text: {err}")))?;
                current.push_str(&text);
            }
            XmlEvent::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if heading {
                        builder.start_section();
                    }
                    builder.push_paragraph(&current);
                    current.clear();
                }
                _ => {}
            },
            XmlEvent::Eof => break,
            _ => {}
        }
    }
    Ok(builder.finish())
}

fn normalize_pdf(path: &Path, bytes: &[u8]) -> Result<NormalizedText, IngestionError> {
    // pdf-extract panics on some malformed inputs; a bad file must not take the
    // whole batch down.
    let extracted = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| IngestionError::parse(path, "pdf parser panicked on malformed input"))?
        .map_err(|err| IngestionError::parse(path, format!("extract pdf text: {err}")))?;

    // Pages are separated by form feeds; each page opens a section.
    let mut builder = NormalizedText::builder();
    for page in extracted.split('\u{c}') {
        let page = NormalizedText::from_plain(page);
        if page.is_blank() {
            continue;
        }
        builder.start_section();
        for paragraph in page.paragraphs() {
            builder.push_paragraph(paragraph);
        }
    }
    Ok(builder.finish())
}
