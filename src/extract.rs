//! Plain-text extraction for uploaded documents.
//!
//! Callers supply raw bytes plus a format tag; this module returns UTF-8
//! text or [`RagError::ExtractionFailed`]. A tag is either a MIME type
//! (`application/pdf`, `text/plain; charset=utf-8`) or a file extension
//! (`pdf`, `.docx`, `txt`, `md`).

use std::io::Read;
use std::path::Path;

use crate::error::{RagError, Result};

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Document formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Markdown,
    Pdf,
    Docx,
}

impl Format {
    /// Resolve a MIME type or file extension.
    pub fn from_tag(tag: &str) -> Option<Format> {
        let tag = tag
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .trim_start_matches('.')
            .to_ascii_lowercase();
        match tag.as_str() {
            MIME_TEXT | "txt" | "text" => Some(Format::Text),
            MIME_MARKDOWN | "text/x-markdown" | "md" | "markdown" => Some(Format::Markdown),
            MIME_PDF | "pdf" => Some(Format::Pdf),
            MIME_DOCX | "docx" => Some(Format::Docx),
            _ => None,
        }
    }

    /// Resolve from a file name's extension.
    pub fn from_path(path: &Path) -> Option<Format> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Format::from_tag)
    }
}

/// Extract plain text from `bytes` in the format named by `format`.
pub fn extract_text(bytes: &[u8], format: &str) -> Result<String> {
    let Some(kind) = Format::from_tag(format) else {
        return Err(RagError::ExtractionFailed(format!(
            "unsupported format: {} (expected txt, md, pdf, or docx)",
            format
        )));
    };
    extract_format(bytes, kind)
}

pub fn extract_format(bytes: &[u8], format: Format) -> Result<String> {
    match format {
        Format::Text | Format::Markdown => extract_utf8(bytes),
        Format::Pdf => extract_pdf(bytes),
        Format::Docx => extract_docx(bytes),
    }
}

fn extract_utf8(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| RagError::ExtractionFailed(format!("text is not valid UTF-8: {}", e)))
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| RagError::ExtractionFailed(format!("PDF: {}", e)))
}

fn ooxml_error(e: impl std::fmt::Display) -> RagError {
    RagError::ExtractionFailed(format!("DOCX: {}", e))
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_error)?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ooxml_error("word/document.xml not found"))?;

    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(ooxml_error)?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml_error("word/document.xml exceeds size limit"));
    }
    extract_paragraphs(&doc_xml)
}

/// Collect `w:t` runs, one line per `w:p` paragraph.
fn extract_paragraphs(xml: &[u8]) -> Result<String> {
    use quick_xml::events::Event;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"tab" => current.push('\t'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                current.push_str(&te.unescape().map_err(ooxml_error)?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => paragraphs.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_error(e)),
            _ => {}
        }
        buf.clear();
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs.join("\n"))
}
