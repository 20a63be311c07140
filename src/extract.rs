//! Text extraction for every supported source type.
//!
//! [`extract`] turns raw bytes plus a declared [`SourceType`] into
//! normalized UTF-8 text and [`StructuralHints`] (headings, table spans,
//! page breaks) positioned by byte offset into that text.
//!
//! | Type | Parser |
//! |------|--------|
//! | pdf | `pdf-extract`; form feeds become page breaks |
//! | docx | `zip` + `quick-xml` over `word/document.xml` |
//! | xlsx | `zip` + `quick-xml` over shared strings and worksheets |
//! | markdown | `pulldown-cmark` |
//! | html | `scraper` |
//! | plaintext | UTF-8 validation only |
//!
//! Extraction is pure and CPU-bound; callers run it on the blocking pool.
//! Any parse failure is [`CorruptSource`](EngineError::CorruptSource) and
//! no partial text is returned.

use std::io::Read;

use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use quick_xml::events::{BytesStart, Event as XmlEvent};
use scraper::{ElementRef, Html};

use kb_engine_core::models::{Heading, SourceType, StructuralHints, TextSpan};
use kb_engine_core::{EngineError, Result};

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub text: String,
    pub hints: StructuralHints,
}

/// Extract text and structural hints from `bytes`.
pub fn extract(bytes: &[u8], source_type: SourceType) -> Result<Extraction> {
    match source_type {
        SourceType::Pdf => extract_pdf(bytes),
        SourceType::Docx => extract_docx(bytes),
        SourceType::Xlsx => extract_xlsx(bytes),
        SourceType::Markdown => extract_markdown(bytes),
        SourceType::Html => extract_html(bytes),
        SourceType::PlainText => extract_plaintext(bytes),
    }
}

/// Extract after resolving a declared type string (`"pdf"`, a MIME type, ...).
pub fn extract_declared(bytes: &[u8], declared: &str) -> Result<Extraction> {
    extract(bytes, SourceType::from_declared(declared)?)
}

fn corrupt(kind: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::CorruptSource(format!("{}: {}", kind, e))
}

fn utf8(bytes: &[u8], kind: &str) -> Result<String> {
    let text = std::str::from_utf8(bytes).map_err(|e| corrupt(kind, format!("invalid UTF-8: {}", e)))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text).to_string())
}

/// Normalize line endings, strip trailing spaces and collapse blank-line runs.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0;
    for line in unified.split('\n') {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_matches('\n').to_string()
}

// ============ Text builder ============

/// Accumulates blocks separated by blank lines and records hints at the
/// offsets where blocks land.
#[derive(Default)]
struct TextBuilder {
    text: String,
    hints: StructuralHints,
    /// The next block starts a new page.
    page_pending: bool,
}

impl TextBuilder {
    /// Start offset for the next block, inserting the separator.
    fn begin_block(&mut self) -> usize {
        if !self.text.is_empty() {
            self.text.push_str("\n\n");
        }
        let start = self.text.len();
        if std::mem::take(&mut self.page_pending) && start > 0 {
            self.hints.page_breaks.push(start);
        }
        start
    }

    fn push_block(&mut self, block: &str) -> Option<TextSpan> {
        let block = normalize_text(block);
        if block.trim().is_empty() {
            return None;
        }
        let start = self.begin_block();
        self.text.push_str(&block);
        Some(TextSpan {
            start,
            end: self.text.len(),
        })
    }

    fn heading(&mut self, level: u8, title: &str) {
        let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
        if let Some(span) = self.push_block(&title) {
            self.hints.headings.push(Heading {
                offset: span.start,
                level,
                title,
            });
        }
    }

    fn table(&mut self, rows: &[String]) {
        let rows: Vec<&str> = rows
            .iter()
            .map(|r| r.trim_end_matches('\t'))
            .filter(|r| !r.trim().is_empty())
            .collect();
        if let Some(span) = self.push_block(&rows.join("\n")) {
            self.hints.tables.push(span);
        }
    }

    fn page_break(&mut self) {
        self.page_pending = true;
    }

    fn finish(self) -> Extraction {
        Extraction {
            text: self.text,
            hints: self.hints,
        }
    }
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<Extraction> {
    let raw = pdf_extract::extract_text_from_mem(bytes).map_err(|e| corrupt("pdf", e))?;
    let mut builder = TextBuilder::default();
    for (i, page) in raw.split('\u{c}').enumerate() {
        if i > 0 {
            builder.page_break();
        }
        for paragraph in normalize_text(page).split("\n\n") {
            builder.push_block(paragraph);
        }
    }
    Ok(builder.finish())
}

// ============ OOXML ============

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive<'a>(bytes: &'a [u8], kind: &str) -> Result<Archive<'a>> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| corrupt(kind, e))
}

/// Read a zip entry, refusing entries that decompress past the limit.
/// `Ok(None)` when the entry does not exist.
fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
    kind: &str,
) -> Result<Option<Vec<u8>>> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(corrupt(kind, e)),
    };
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| corrupt(kind, e))?;
    if out.len() as u64 >= max_bytes {
        return Err(corrupt(
            kind,
            format!("ZIP entry {} exceeds size limit ({} bytes)", name, max_bytes),
        ));
    }
    Ok(Some(out))
}

fn attr_value(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() == local {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// `Heading2` → 2, `Title` → 1.
fn heading_level(style: &str) -> Option<u8> {
    let lower = style.to_ascii_lowercase();
    if lower == "title" {
        return Some(1);
    }
    let digits = lower.strip_prefix("heading")?.trim_start_matches(|c: char| !c.is_ascii_digit());
    digits.parse::<u8>().ok().map(|l| l.clamp(1, 9))
}

fn extract_docx(bytes: &[u8]) -> Result<Extraction> {
    let mut archive = open_archive(bytes, "docx")?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES, "docx")?
        .ok_or_else(|| corrupt("docx", "word/document.xml not found"))?;

    let mut builder = TextBuilder::default();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();

    let mut paragraph = String::new();
    let mut heading: Option<u8> = None;
    let mut in_text = false;
    let mut table_depth = 0usize;
    let mut rows: Vec<String> = Vec::new();
    let mut cells: Vec<String> = Vec::new();
    let mut cell = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    paragraph.clear();
                    heading = None;
                }
                b"pStyle" => {
                    heading = attr_value(&e, b"val").as_deref().and_then(heading_level);
                }
                b"t" => in_text = true,
                b"tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        rows.clear();
                    }
                }
                b"tr" if table_depth == 1 => cells.clear(),
                b"tc" if table_depth == 1 => cell.clear(),
                _ => {}
            },
            Ok(XmlEvent::Empty(e)) => match e.local_name().as_ref() {
                b"pStyle" => {
                    heading = attr_value(&e, b"val").as_deref().and_then(heading_level);
                }
                b"tab" => paragraph.push('\t'),
                b"br" | b"cr" => paragraph.push('\n'),
                _ => {}
            },
            Ok(XmlEvent::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| corrupt("docx", e))?;
                paragraph.push_str(&text);
            }
            Ok(XmlEvent::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if table_depth > 0 {
                        let text = paragraph.trim();
                        if !text.is_empty() {
                            if !cell.is_empty() {
                                cell.push(' ');
                            }
                            cell.push_str(text);
                        }
                    } else if let Some(level) = heading {
                        builder.heading(level, &paragraph);
                    } else {
                        builder.push_block(&paragraph);
                    }
                    paragraph.clear();
                    heading = None;
                }
                b"tc" if table_depth == 1 => cells.push(cell.replace(['\t', '\n'], " ")),
                b"tr" if table_depth == 1 => rows.push(cells.join("\t")),
                b"tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 {
                        builder.table(&rows);
                        rows.clear();
                    }
                }
                _ => {}
            },
            Ok(XmlEvent::Eof) => break,
            Err(e) => return Err(corrupt("docx", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(builder.finish())
}

fn extract_xlsx(bytes: &[u8]) -> Result<Extraction> {
    let mut archive = open_archive(bytes, "xlsx")?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_names = list_worksheet_names(&archive);
    if sheet_names.is_empty() {
        return Err(corrupt("xlsx", "workbook has no worksheets"));
    }

    let mut builder = TextBuilder::default();
    for (idx, name) in sheet_names.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let Some(sheet_xml) = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES, "xlsx")?
        else {
            continue;
        };
        let rows = extract_sheet_rows(&sheet_xml, &shared_strings)?;
        if rows.is_empty() {
            continue;
        }
        builder.heading(2, &format!("Sheet {}", idx + 1));
        builder.table(&rows);
    }
    Ok(builder.finish())
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>> {
    let Some(xml) = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES, "xlsx")?
    else {
        return Ok(Vec::new());
    };
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(XmlEvent::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(XmlEvent::Text(t)) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&t.unescape().map_err(|e| corrupt("xlsx", e))?);
                }
            }
            Ok(XmlEvent::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.push(current.take().unwrap_or_default()),
                _ => {}
            },
            Ok(XmlEvent::Eof) => break,
            Err(e) => return Err(corrupt("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(archive: &Archive<'_>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

#[derive(Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Boolean,
    Other,
}

/// Rows of a worksheet, cells joined with tabs.
fn extract_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut kind = CellKind::Other;
    let mut in_value = false;
    let mut value = String::new();
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    kind = match attr_value(&e, b"t").as_deref() {
                        Some("s") => CellKind::Shared,
                        Some("inlineStr") => CellKind::Inline,
                        Some("b") => CellKind::Boolean,
                        _ => CellKind::Other,
                    };
                    value.clear();
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(XmlEvent::Text(t)) if in_value => {
                value.push_str(&t.unescape().map_err(|e| corrupt("xlsx", e))?);
            }
            Ok(XmlEvent::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let raw = value.trim();
                    let text = match kind {
                        CellKind::Shared => raw
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i))
                            .cloned()
                            .unwrap_or_default(),
                        CellKind::Boolean => match raw {
                            "1" => "TRUE".to_string(),
                            "0" => "FALSE".to_string(),
                            other => other.to_string(),
                        },
                        CellKind::Inline | CellKind::Other => raw.to_string(),
                    };
                    if !text.is_empty() {
                        row.push(text.replace(['\t', '\n'], " "));
                        cell_count += 1;
                    }
                    value.clear();
                }
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join("\t"));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(XmlEvent::Eof) => break,
            Err(e) => return Err(corrupt("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows)
}

// ============ Markdown ============

fn heading_number(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

fn extract_markdown(bytes: &[u8]) -> Result<Extraction> {
    let source = utf8(bytes, "markdown")?;
    let mut builder = TextBuilder::default();

    let mut current = String::new();
    let mut heading: Option<u8> = None;
    let mut table_rows: Option<Vec<String>> = None;
    let mut row: Vec<String> = Vec::new();
    let mut cell: Option<String> = None;

    let flush = |builder: &mut TextBuilder, current: &mut String| {
        builder.push_block(current);
        current.clear();
    };

    let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH;
    for event in Parser::new_ext(&source, options) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                flush(&mut builder, &mut current);
                heading = Some(heading_number(level));
            }
            Event::End(TagEnd::Heading(_)) => {
                builder.heading(heading.take().unwrap_or(1), &current);
                current.clear();
            }
            Event::Start(Tag::Paragraph)
            | Event::Start(Tag::CodeBlock(_))
            | Event::Start(Tag::BlockQuote(_)) => {
                if cell.is_none() && !current.trim_start_matches("- ").is_empty() {
                    flush(&mut builder, &mut current);
                }
            }
            Event::Start(Tag::Item) => {
                flush(&mut builder, &mut current);
                current.push_str("- ");
            }
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::CodeBlock)
            | Event::End(TagEnd::BlockQuote(_))
            | Event::End(TagEnd::Item) => {
                flush(&mut builder, &mut current);
            }
            Event::Start(Tag::Table(_)) => {
                flush(&mut builder, &mut current);
                table_rows = Some(Vec::new());
            }
            Event::Start(Tag::TableHead) | Event::Start(Tag::TableRow) => row.clear(),
            Event::Start(Tag::TableCell) => cell = Some(String::new()),
            Event::End(TagEnd::TableCell) => {
                if let Some(c) = cell.take() {
                    row.push(c.trim().to_string());
                }
            }
            Event::End(TagEnd::TableHead) | Event::End(TagEnd::TableRow) => {
                if let Some(rows) = table_rows.as_mut() {
                    rows.push(row.join("\t"));
                }
                row.clear();
            }
            Event::End(TagEnd::Table) => {
                if let Some(rows) = table_rows.take() {
                    builder.table(&rows);
                }
            }
            Event::Text(t) | Event::Code(t) => match cell.as_mut() {
                Some(c) => c.push_str(&t),
                None => current.push_str(&t),
            },
            Event::SoftBreak => match cell.as_mut() {
                Some(c) => c.push(' '),
                None => current.push('\n'),
            },
            Event::HardBreak => current.push('\n'),
            Event::Rule => flush(&mut builder, &mut current),
            _ => {}
        }
    }
    flush(&mut builder, &mut current);
    Ok(builder.finish())
}

// ============ HTML ============

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "head", "svg"];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "header", "footer", "nav", "aside", "ul", "ol",
    "li", "dl", "dt", "dd", "blockquote", "figure", "figcaption", "form", "fieldset", "address",
    "hr", "body", "html", "details", "summary",
];

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn flush_inline(builder: &mut TextBuilder, current: &mut String) {
    let block: Vec<String> = current
        .split('\n')
        .map(collapse_whitespace)
        .filter(|l| !l.is_empty())
        .collect();
    builder.push_block(&block.join("\n"));
    current.clear();
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<String>())
}

fn walk_html(el: ElementRef<'_>, builder: &mut TextBuilder, current: &mut String) {
    let name = el.value().name();
    if SKIPPED_TAGS.contains(&name) {
        return;
    }
    match name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            flush_inline(builder, current);
            let level = name[1..].parse::<u8>().unwrap_or(1);
            builder.heading(level, &element_text(el));
            return;
        }
        "table" => {
            flush_inline(builder, current);
            let rows: Vec<String> = el
                .descendants()
                .filter_map(ElementRef::wrap)
                .filter(|e| e.value().name() == "tr")
                .map(|tr| {
                    tr.children()
                        .filter_map(ElementRef::wrap)
                        .filter(|c| matches!(c.value().name(), "td" | "th"))
                        .map(element_text)
                        .collect::<Vec<_>>()
                        .join("\t")
                })
                .collect();
            builder.table(&rows);
            return;
        }
        "pre" => {
            flush_inline(builder, current);
            builder.push_block(&el.text().collect::<String>());
            return;
        }
        "br" => {
            current.push('\n');
            return;
        }
        _ => {}
    }

    let is_block = BLOCK_TAGS.contains(&name);
    if is_block {
        flush_inline(builder, current);
        if name == "li" {
            current.push_str("- ");
        }
    }
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            current.push_str(text);
        } else if let Some(child_el) = ElementRef::wrap(child) {
            walk_html(child_el, builder, current);
        }
    }
    if is_block {
        flush_inline(builder, current);
    }
}

fn extract_html(bytes: &[u8]) -> Result<Extraction> {
    let source = utf8(bytes, "html")?;
    let document = Html::parse_document(&source);
    let mut builder = TextBuilder::default();
    let mut current = String::new();
    walk_html(document.root_element(), &mut builder, &mut current);
    flush_inline(&mut builder, &mut current);
    Ok(builder.finish())
}

// ============ Plain text ============

fn extract_plaintext(bytes: &[u8]) -> Result<Extraction> {
    let text = utf8(bytes, "plaintext")?;
    Ok(Extraction {
        text: normalize_text(&text),
        hints: StructuralHints::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_declared_type_is_unsupported() {
        let err = extract_declared(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedFormat(_)));
    }

    #[test]
    fn invalid_pdf_is_corrupt() {
        let err = extract(b"not a pdf", SourceType::Pdf).unwrap_err();
        assert!(matches!(err, EngineError::CorruptSource(_)));
    }

    #[test]
    fn invalid_zip_is_corrupt() {
        for t in [SourceType::Docx, SourceType::Xlsx] {
            let err = extract(b"not a zip", t).unwrap_err();
            assert!(matches!(err, EngineError::CorruptSource(_)));
        }
    }

    #[test]
    fn plaintext_must_be_utf8() {
        let err = extract(&[0xff, 0xfe, 0x41], SourceType::PlainText).unwrap_err();
        assert!(matches!(err, EngineError::CorruptSource(_)));
    }

    #[test]
    fn plaintext_is_normalized() {
        let out = extract(b"\xef\xbb\xbfline one  \r\nline two\r\n\r\n\r\n\r\nnext", SourceType::PlainText)
            .unwrap();
        assert_eq!(out.text, "line one\nline two\n\nnext");
        assert_eq!(out.hints, StructuralHints::default());
    }

    #[test]
    fn markdown_headings_and_tables_become_hints() {
        let md = "# Guide\n\nIntro text.\n\n## Setup\n\n| key | value |\n|-----|-------|\n| a | 1 |\n\n- one\n- two\n";
        let out = extract(md.as_bytes(), SourceType::Markdown).unwrap();

        let titles: Vec<(&str, u8)> = out
            .hints
            .headings
            .iter()
            .map(|h| (h.title.as_str(), h.level))
            .collect();
        assert_eq!(titles, vec![("Guide", 1), ("Setup", 2)]);
        assert_eq!(&out.text[out.hints.headings[1].offset..][..5], "Setup");

        assert_eq!(out.hints.tables.len(), 1);
        let t = out.hints.tables[0];
        assert_eq!(&out.text[t.start..t.end], "key\tvalue\na\t1");
        assert!(out.text.contains("- one"));
        assert!(out.text.contains("Intro text."));
    }

    #[test]
    fn markdown_code_blocks_keep_lines() {
        let md = "Text\n\n```\nfn main() {\n    run();\n}\n```\n";
        let out = extract(md.as_bytes(), SourceType::Markdown).unwrap();
        assert!(out.text.contains("fn main() {\n    run();\n}"));
    }

    #[test]
    fn html_drops_scripts_and_keeps_structure() {
        let html = r#"<html><head><title>t</title><style>p{}</style></head>
            <body><h1>Title</h1><p>First   paragraph <b>bold</b>.</p>
            <script>var x = 1;</script>
            <table><tr><th>k</th><th>v</th></tr><tr><td>a</td><td>1</td></tr></table>
            <ul><li>item</li></ul></body></html>"#;
        let out = extract(html.as_bytes(), SourceType::Html).unwrap();
        assert!(!out.text.contains("var x"));
        assert!(!out.text.contains("p{}"));
        assert!(out.text.contains("First paragraph bold."));
        assert_eq!(out.hints.headings[0].title, "Title");
        let t = out.hints.tables[0];
        assert_eq!(&out.text[t.start..t.end], "k\tv\na\t1");
        assert!(out.text.contains("- item"));
    }

    #[test]
    fn heading_styles_map_to_levels() {
        assert_eq!(heading_level("Heading1"), Some(1));
        assert_eq!(heading_level("heading 3"), Some(3));
        assert_eq!(heading_level("Title"), Some(1));
        assert_eq!(heading_level("Normal"), None);
    }

    #[test]
    fn builder_records_page_breaks_between_pages() {
        let mut b = TextBuilder::default();
        b.push_block("page one");
        b.page_break();
        b.push_block("page two");
        b.page_break();
        let out = b.finish();
        assert_eq!(out.text, "page one\n\npage two");
        assert_eq!(out.hints.page_breaks, vec![10]);
        assert_eq!(out.hints.page_at(12), Some(2));
        assert_eq!(out.hints.page_at(0), Some(1));
    }
}
