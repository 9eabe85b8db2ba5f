//! Plain-text extraction for uploaded knowledge files.
//!
//! Dispatch is by media type. PDF and DOCX get dedicated extractors and
//! HTML is reduced to its visible text; everything else, including
//! unrecognized types, is passed through as (lossy) UTF-8.

use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;
use scraper::{Html, Node};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_HTML: &str = "text/html";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_UNKNOWN: &str = "application/octet-stream";

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const HTML_BLOCKS: [&str; 16] = [
    "p", "div", "br", "li", "tr", "h1", "h2", "h3", "h4", "h5", "h6", "section", "article",
    "blockquote", "pre", "table",
];
const HTML_SKIPPED: [&str; 5] = ["script", "style", "noscript", "template", "head"];

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

/// Media type for a file name, by extension. Unknown extensions map to
/// [`MIME_UNKNOWN`], which extracts as pass-through text.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => MIME_PDF,
        Some("docx") => MIME_DOCX,
        Some("html" | "htm") => MIME_HTML,
        Some("md" | "markdown") => MIME_MARKDOWN,
        Some("txt" | "text") => MIME_TEXT,
        _ => MIME_UNKNOWN,
    }
}

/// Whether extraction for `mime_type` is CPU-heavy enough to move off the
/// async runtime.
pub fn is_blocking(mime_type: &str) -> bool {
    matches!(base_type(mime_type), MIME_PDF | MIME_DOCX)
}

fn base_type(mime_type: &str) -> &str {
    mime_type.split(';').next().unwrap_or_default().trim()
}

pub fn extract_text(bytes: &[u8], mime_type: &str) -> Result<String, ExtractError> {
    match base_type(mime_type) {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_HTML | "application/xhtml+xml" => Ok(extract_html(&String::from_utf8_lossy(bytes))),
        _ => Ok(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_body_text(&xml)
}

/// Text of every `w:t` run, with a blank line after each `w:p` paragraph.
fn docx_body_text(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push_str("\n\n"),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Visible text of an HTML document, with block elements separated by
/// blank lines so paragraph chunking still applies.
fn extract_html(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut out = String::new();
    for node in doc.root_element().descendants() {
        match node.value() {
            Node::Element(e) if HTML_BLOCKS.contains(&e.name()) => out.push_str("\n\n"),
            Node::Text(text) => {
                let hidden = node.ancestors().any(|a| {
                    a.value()
                        .as_element()
                        .map(|e| HTML_SKIPPED.contains(&e.name()))
                        .unwrap_or(false)
                });
                if !hidden {
                    out.push_str(text);
                }
            }
            _ => {}
        }
    }
    out.split("\n\n")
        .map(|block| block.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|block| !block.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with(document_xml: &str) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(document_xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_unknown_type_passes_through() {
        let text = extract_text(b"plain words", "application/octet-stream").unwrap();
        assert_eq!(text, "plain words");
        let text = extract_text("caf\u{e9}".as_bytes(), "text/plain; charset=utf-8").unwrap();
        assert_eq!(text, "caf\u{e9}");
    }

    #[test]
    fn test_invalid_pdf_returns_error() {
        let err = extract_text(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
        assert!(err.to_string().starts_with("PDF extraction failed: "));
    }

    #[test]
    fn test_invalid_zip_returns_error_for_docx() {
        let err = extract_text(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
        assert!(err.to_string().starts_with("DOCX extraction failed: "));
        let wrapped = crate::error::IngestError::from(err);
        assert!(wrapped.to_string().starts_with("DOCX extraction failed: "));
    }

    #[test]
    fn test_docx_paragraphs_and_runs() {
        let xml = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>
<w:p><w:r><w:t xml:space="preserve">Returns are </w:t></w:r><w:r><w:t>free.</w:t></w:r></w:p>
<w:p><w:r><w:t>Shipping &amp; handling</w:t></w:r></w:p>
</w:body></w:document>"#;
        let text = extract_text(&docx_with(xml), MIME_DOCX).unwrap();
        assert_eq!(text.trim(), "Returns are free.\n\nShipping & handling");
    }

    #[test]
    fn test_html_visible_blocks() {
        let html = "<html><head><title>t</title></head><body><h1>FAQ</h1>\
                    <script>track()</script><p>Open  daily.</p><p>Closed holidays.</p></body></html>";
        let text = extract_text(html.as_bytes(), MIME_HTML).unwrap();
        assert_eq!(text, "FAQ\n\nOpen daily.\n\nClosed holidays.");
    }

    #[test]
    fn test_mime_for_path() {
        assert_eq!(mime_for_path(Path::new("a/Guide.PDF")), MIME_PDF);
        assert_eq!(mime_for_path(Path::new("notes.md")), MIME_MARKDOWN);
        assert_eq!(mime_for_path(Path::new("blob")), "application/octet-stream");
        assert!(is_blocking(MIME_DOCX));
        assert!(!is_blocking(MIME_TEXT));
    }
}
