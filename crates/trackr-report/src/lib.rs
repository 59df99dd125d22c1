//! Declarative report documents rendered to DOCX packages.
//!
//! A [`Document`] is plain data: headings, paragraphs, tables and call-outs with
//! their styling attributes. [`render`] turns it into the bytes of a `.docx`
//! file without touching the network or the filesystem.

use std::fmt::Write as _;
use std::io::{Cursor, Read, Write};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const CRATE_NAME: &str = "trackr-report";

/// Usable width of a Letter page with one-inch margins, in twentieths of a point.
const CONTENT_WIDTH_DXA: u32 = 9360;
const HEADER_FILL: &str = "D9E2F3";

const NS_W: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";
const NS_R: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("heading level {0} is outside 1..=3")]
    InvalidHeadingLevel(u8),
    #[error("table {table} has no header row")]
    EmptyTable { table: usize },
    #[error("table {table} row {row} has {found} cells, header has {expected}")]
    RaggedTable {
        table: usize,
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("table {table} declares {found} column widths for {expected} columns")]
    ColumnWidthMismatch {
        table: usize,
        expected: usize,
        found: usize,
    },
    #[error("`{0}` is not a six-digit hex color")]
    InvalidColor(String),
    #[error("malformed package: {0}")]
    MalformedPackage(String),
    #[error("parsing document description: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    #[default]
    Left,
    Center,
    Right,
    Justify,
}

impl Alignment {
    fn ooxml(self) -> Option<&'static str> {
        match self {
            Self::Left => None,
            Self::Center => Some("center"),
            Self::Right => Some("right"),
            Self::Justify => Some("both"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TextStyle {
    pub bold: bool,
    pub italic: bool,
    /// Hex color such as `C00000`.
    pub color: Option<String>,
    /// Size in points.
    pub font_size: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub text: String,
    #[serde(flatten)]
    pub style: TextStyle,
}

impl Run {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            style: TextStyle::default(),
        }
    }

    pub fn bold(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            style: TextStyle {
                bold: true,
                ..TextStyle::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Paragraph {
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(default)]
    pub align: Alignment,
}

impl Paragraph {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            runs: vec![Run::plain(text)],
            align: Alignment::Left,
        }
    }

    pub fn text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableCell {
    pub text: String,
    #[serde(flatten)]
    pub style: TextStyle,
    #[serde(default)]
    pub shade: Option<String>,
    #[serde(default)]
    pub align: Alignment,
}

impl TableCell {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

impl From<&str> for TableCell {
    fn from(value: &str) -> Self {
        Self::plain(value)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub header_row: Vec<TableCell>,
    #[serde(default)]
    pub body_rows: Vec<Vec<TableCell>>,
    /// Widths in twentieths of a point; empty splits the page evenly.
    #[serde(default)]
    pub column_widths: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalloutTone {
    Info,
    Success,
    Warning,
    Danger,
}

impl CalloutTone {
    /// (fill, accent)
    fn palette(self) -> (&'static str, &'static str) {
        match self {
            Self::Info => ("DEEAF6", "2E75B6"),
            Self::Success => ("E2EFDA", "548235"),
            Self::Warning => ("FFF2CC", "BF8F00"),
            Self::Danger => ("FBE4E4", "C00000"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callout {
    pub tone: CalloutTone,
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Section {
    Heading { level: u8, text: String },
    Paragraph(Paragraph),
    Table(Table),
    Callout(Callout),
    PageBreak,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl Document {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ReportError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn heading(mut self, level: u8, text: impl Into<String>) -> Self {
        self.sections.push(Section::Heading {
            level,
            text: text.into(),
        });
        self
    }

    pub fn paragraph(mut self, paragraph: Paragraph) -> Self {
        self.sections.push(Section::Paragraph(paragraph));
        self
    }

    pub fn table(mut self, table: Table) -> Self {
        self.sections.push(Section::Table(table));
        self
    }

    pub fn callout(mut self, tone: CalloutTone, title: Option<&str>, text: impl Into<String>) -> Self {
        self.sections.push(Section::Callout(Callout {
            tone,
            title: title.map(str::to_string),
            text: text.into(),
        }));
        self
    }

    pub fn page_break(mut self) -> Self {
        self.sections.push(Section::PageBreak);
        self
    }

    /// Conventional deliverable name, e.g. `1.1-Tech-Stack-Analysis-Report.docx`.
    pub fn file_name_for(&self, key: &str) -> String {
        let slug = self
            .title
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        if slug.is_empty() {
            format!("{key}.docx")
        } else {
            format!("{key}-{slug}.docx")
        }
    }

    /// Paragraph texts in reading order, as [`extract_text`] reports them.
    pub fn text_content(&self) -> Vec<String> {
        let mut out = vec![clean_text(&self.title)];
        if let Some(subtitle) = &self.subtitle {
            out.push(clean_text(subtitle));
        }
        for section in &self.sections {
            match section {
                Section::Heading { text, .. } => out.push(clean_text(text)),
                Section::Paragraph(p) => out.push(clean_text(&p.text())),
                Section::Table(table) => {
                    for cell in table.header_row.iter().chain(table.body_rows.iter().flatten()) {
                        out.push(clean_text(&cell.text));
                    }
                }
                Section::Callout(callout) => {
                    if let Some(title) = &callout.title {
                        out.push(clean_text(title));
                    }
                    out.push(clean_text(&callout.text));
                }
                Section::PageBreak => {}
            }
        }
        out.retain(|t| !t.is_empty());
        out
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        let mut table_index = 0usize;
        for section in &self.sections {
            match section {
                Section::Heading { level, .. } => {
                    if !(1..=3).contains(level) {
                        return Err(ReportError::InvalidHeadingLevel(*level));
                    }
                }
                Section::Paragraph(p) => {
                    for run in &p.runs {
                        check_color(run.style.color.as_deref())?;
                    }
                }
                Section::Table(table) => {
                    let expected = table.header_row.len();
                    if expected == 0 {
                        return Err(ReportError::EmptyTable { table: table_index });
                    }
                    for (row, cells) in table.body_rows.iter().enumerate() {
                        if cells.len() != expected {
                            return Err(ReportError::RaggedTable {
                                table: table_index,
                                row,
                                expected,
                                found: cells.len(),
                            });
                        }
                    }
                    if !table.column_widths.is_empty() && table.column_widths.len() != expected {
                        return Err(ReportError::ColumnWidthMismatch {
                            table: table_index,
                            expected,
                            found: table.column_widths.len(),
                        });
                    }
                    for cell in table.header_row.iter().chain(table.body_rows.iter().flatten()) {
                        check_color(cell.style.color.as_deref())?;
                        check_color(cell.shade.as_deref())?;
                    }
                    table_index += 1;
                }
                Section::Callout(_) | Section::PageBreak => {}
            }
        }
        Ok(())
    }
}

fn check_color(color: Option<&str>) -> Result<(), ReportError> {
    match color {
        Some(raw) if normalize_color(raw).is_none() => Err(ReportError::InvalidColor(raw.to_string())),
        _ => Ok(()),
    }
}

fn normalize_color(raw: &str) -> Option<String> {
    let hex = raw.trim().trim_start_matches('#');
    (hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit())).then(|| hex.to_ascii_uppercase())
}

/// Drop characters XML 1.0 cannot carry.
fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}

fn escape(text: &str) -> String {
    quick_xml::escape::escape(clean_text(text).as_str()).into_owned()
}

/// Render a document into DOCX bytes.
pub fn render(doc: &Document) -> Result<Vec<u8>, ReportError> {
    doc.validate()?;

    let document_xml = document_xml(doc);
    let core_xml = core_xml(doc);
    let parts: [(&str, &str); 7] = [
        ("[Content_Types].xml", CONTENT_TYPES_XML),
        ("_rels/.rels", PACKAGE_RELS_XML),
        ("word/_rels/document.xml.rels", DOCUMENT_RELS_XML),
        ("word/document.xml", &document_xml),
        ("word/styles.xml", STYLES_XML),
        ("word/footer1.xml", FOOTER_XML),
        ("docProps/core.xml", &core_xml),
    ];

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, body) in parts {
        zip.start_file(name, options)?;
        zip.write_all(body.as_bytes())?;
    }
    let bytes = zip.finish()?.into_inner();
    debug!(title = %doc.title, sections = doc.sections.len(), bytes = bytes.len(), "rendered document");
    Ok(bytes)
}

/// Paragraph texts of a rendered package's main document part, empty paragraphs skipped.
pub fn extract_text(bytes: &[u8]) -> Result<Vec<String>, ReportError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut xml = Vec::new();
    archive.by_name("word/document.xml")?.read_to_end(&mut xml)?;

    let mut reader = Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.name().as_ref() == b"w:p" => current = Some(String::new()),
            Event::End(e) if e.name().as_ref() == b"w:p" => {
                if let Some(text) = current.take().filter(|t| !t.is_empty()) {
                    paragraphs.push(text);
                }
            }
            Event::Start(e) if e.name().as_ref() == b"w:t" => in_text = true,
            Event::End(e) if e.name().as_ref() == b"w:t" => in_text = false,
            Event::Text(e) if in_text => {
                if let Some(paragraph) = current.as_mut() {
                    paragraph.push_str(&e.unescape()?);
                }
            }
            Event::CData(e) if in_text => {
                if let Some(paragraph) = current.as_mut() {
                    paragraph.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if in_text || current.is_some() {
        return Err(ReportError::MalformedPackage("document ends inside a paragraph".into()));
    }
    Ok(paragraphs)
}

fn document_xml(doc: &Document) -> String {
    let mut body = String::new();
    write_styled_paragraph(&mut body, "Title", &doc.title);
    if let Some(subtitle) = &doc.subtitle {
        write_styled_paragraph(&mut body, "Subtitle", subtitle);
    }

    for section in &doc.sections {
        match section {
            Section::Heading { level, text } => {
                write_styled_paragraph(&mut body, &format!("Heading{level}"), text);
            }
            Section::Paragraph(p) => write_paragraph(&mut body, &p.runs, p.align),
            Section::Table(table) => write_table(&mut body, table),
            Section::Callout(callout) => write_callout(&mut body, callout),
            Section::PageBreak => body.push_str(r#"<w:p><w:r><w:br w:type="page"/></w:r></w:p>"#),
        }
    }

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<w:document xmlns:w="{w}" xmlns:r="{r}"><w:body>{body}"#,
            r#"<w:sectPr><w:footerReference w:type="default" r:id="rId2"/>"#,
            r#"<w:pgSz w:w="12240" w:h="15840"/>"#,
            r#"<w:pgMar w:top="1440" w:right="1440" w:bottom="1440" w:left="1440" w:header="720" w:footer="720" w:gutter="0"/>"#,
            r#"</w:sectPr></w:body></w:document>"#
        ),
        w = NS_W,
        r = NS_R,
        body = body
    )
}

fn write_styled_paragraph(out: &mut String, style: &str, text: &str) {
    let _ = write!(
        out,
        r#"<w:p><w:pPr><w:pStyle w:val="{style}"/></w:pPr><w:r><w:t xml:space="preserve">{}</w:t></w:r></w:p>"#,
        escape(text)
    );
}

fn write_paragraph(out: &mut String, runs: &[Run], align: Alignment) {
    out.push_str("<w:p>");
    if let Some(jc) = align.ooxml() {
        let _ = write!(out, r#"<w:pPr><w:jc w:val="{jc}"/></w:pPr>"#);
    }
    for run in runs {
        write_run(out, &run.text, &run.style);
    }
    out.push_str("</w:p>");
}

fn write_run(out: &mut String, text: &str, style: &TextStyle) {
    out.push_str("<w:r>");
    let color = style.color.as_deref().and_then(normalize_color);
    if style.bold || style.italic || color.is_some() || style.font_size.is_some() {
        out.push_str("<w:rPr>");
        if style.bold {
            out.push_str("<w:b/>");
        }
        if style.italic {
            out.push_str("<w:i/>");
        }
        if let Some(color) = color {
            let _ = write!(out, r#"<w:color w:val="{color}"/>"#);
        }
        if let Some(points) = style.font_size {
            let _ = write!(out, r#"<w:sz w:val="{}"/>"#, u32::from(points) * 2);
        }
        out.push_str("</w:rPr>");
    }
    let _ = write!(out, r#"<w:t xml:space="preserve">{}</w:t></w:r>"#, escape(text));
}

fn column_widths(table: &Table) -> Vec<u32> {
    if !table.column_widths.is_empty() {
        return table.column_widths.clone();
    }
    let columns = table.header_row.len().max(1) as u32;
    vec![CONTENT_WIDTH_DXA / columns; columns as usize]
}

fn write_cell(out: &mut String, cell: &TableCell, width: u32, header: bool) {
    let shade = cell
        .shade
        .as_deref()
        .and_then(normalize_color)
        .or_else(|| header.then(|| HEADER_FILL.to_string()));
    let _ = write!(out, r#"<w:tc><w:tcPr><w:tcW w:w="{width}" w:type="dxa"/>"#);
    if let Some(fill) = shade {
        let _ = write!(out, r#"<w:shd w:val="clear" w:color="auto" w:fill="{fill}"/>"#);
    }
    out.push_str("</w:tcPr>");
    let style = TextStyle {
        bold: cell.style.bold || header,
        ..cell.style.clone()
    };
    out.push_str("<w:p>");
    if let Some(jc) = cell.align.ooxml() {
        let _ = write!(out, r#"<w:pPr><w:jc w:val="{jc}"/></w:pPr>"#);
    }
    write_run(out, &cell.text, &style);
    out.push_str("</w:p></w:tc>");
}

fn write_table(out: &mut String, table: &Table) {
    let widths = column_widths(table);
    out.push_str(r#"<w:tbl><w:tblPr><w:tblStyle w:val="TableGrid"/><w:tblW w:w="0" w:type="auto"/></w:tblPr><w:tblGrid>"#);
    for width in &widths {
        let _ = write!(out, r#"<w:gridCol w:w="{width}"/>"#);
    }
    out.push_str("</w:tblGrid>");

    out.push_str("<w:tr><w:trPr><w:tblHeader/></w:trPr>");
    for (cell, width) in table.header_row.iter().zip(&widths) {
        write_cell(out, cell, *width, true);
    }
    out.push_str("</w:tr>");

    for row in &table.body_rows {
        out.push_str("<w:tr>");
        for (cell, width) in row.iter().zip(&widths) {
            write_cell(out, cell, *width, false);
        }
        out.push_str("</w:tr>");
    }
    out.push_str("</w:tbl>");
    // Word merges adjacent tables without a paragraph between them.
    out.push_str("<w:p/>");
}

fn write_callout(out: &mut String, callout: &Callout) {
    let (fill, accent) = callout.tone.palette();
    let _ = write!(
        out,
        concat!(
            r#"<w:tbl><w:tblPr><w:tblW w:w="{width}" w:type="dxa"/><w:tblBorders>"#,
            r#"<w:left w:val="single" w:sz="24" w:space="0" w:color="{accent}"/>"#,
            r#"</w:tblBorders></w:tblPr><w:tblGrid><w:gridCol w:w="{width}"/></w:tblGrid>"#,
            r#"<w:tr><w:tc><w:tcPr><w:tcW w:w="{width}" w:type="dxa"/>"#,
            r#"<w:shd w:val="clear" w:color="auto" w:fill="{fill}"/></w:tcPr>"#
        ),
        width = CONTENT_WIDTH_DXA,
        accent = accent,
        fill = fill
    );
    if let Some(title) = &callout.title {
        let style = TextStyle {
            bold: true,
            color: Some(accent.to_string()),
            ..TextStyle::default()
        };
        out.push_str("<w:p>");
        write_run(out, title, &style);
        out.push_str("</w:p>");
    }
    write_paragraph(out, &[Run::plain(callout.text.clone())], Alignment::Left);
    out.push_str("</w:tc></w:tr></w:tbl><w:p/>");
}

fn core_xml(doc: &Document) -> String {
    let created = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" "#,
            r#"xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:dcterms="http://purl.org/dc/terms/" "#,
            r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
            r#"<dc:title>{title}</dc:title><dc:creator>{creator}</dc:creator>"#,
            r#"<dcterms:created xsi:type="dcterms:W3CDTF">{created}</dcterms:created>"#,
            r#"<dcterms:modified xsi:type="dcterms:W3CDTF">{created}</dcterms:modified>"#,
            r#"</cp:coreProperties>"#
        ),
        title = escape(&doc.title),
        creator = escape(doc.author.as_deref().unwrap_or("trackr")),
        created = created
    )
}

const CONTENT_TYPES_XML: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
    r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#,
    r#"<Default Extension="xml" ContentType="application/xml"/>"#,
    r#"<Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/>"#,
    r#"<Override PartName="/word/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.styles+xml"/>"#,
    r#"<Override PartName="/word/footer1.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.footer+xml"/>"#,
    r#"<Override PartName="/docProps/core.xml" ContentType="application/vnd.openxmlformats-package.core-properties+xml"/>"#,
    r#"</Types>"#
);

const PACKAGE_RELS_XML: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/>"#,
    r#"<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/package/2006/relationships/metadata/core-properties" Target="docProps/core.xml"/>"#,
    r#"</Relationships>"#
);

const DOCUMENT_RELS_XML: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>"#,
    r#"<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/footer" Target="footer1.xml"/>"#,
    r#"</Relationships>"#
);

const FOOTER_XML: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<w:ftr xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">"#,
    r#"<w:p><w:pPr><w:jc w:val="center"/></w:pPr>"#,
    r#"<w:r><w:t xml:space="preserve">Page </w:t></w:r>"#,
    r#"<w:r><w:fldChar w:fldCharType="begin"/></w:r>"#,
    r#"<w:r><w:instrText xml:space="preserve"> PAGE </w:instrText></w:r>"#,
    r#"<w:r><w:fldChar w:fldCharType="separate"/></w:r>"#,
    r#"<w:r><w:t>1</w:t></w:r>"#,
    r#"<w:r><w:fldChar w:fldCharType="end"/></w:r>"#,
    r#"</w:p></w:ftr>"#
);

const STYLES_XML: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<w:styles xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">"#,
    r#"<w:docDefaults><w:rPrDefault><w:rPr><w:rFonts w:ascii="Calibri" w:hAnsi="Calibri" w:cs="Calibri"/>"#,
    r#"<w:sz w:val="22"/></w:rPr></w:rPrDefault>"#,
    r#"<w:pPrDefault><w:pPr><w:spacing w:after="120" w:line="264" w:lineRule="auto"/></w:pPr></w:pPrDefault></w:docDefaults>"#,
    r#"<w:style w:type="paragraph" w:default="1" w:styleId="Normal"><w:name w:val="Normal"/></w:style>"#,
    r#"<w:style w:type="paragraph" w:styleId="Title"><w:name w:val="Title"/><w:basedOn w:val="Normal"/>"#,
    r#"<w:pPr><w:spacing w:after="240"/></w:pPr><w:rPr><w:b/><w:color w:val="1F3864"/><w:sz w:val="48"/></w:rPr></w:style>"#,
    r#"<w:style w:type="paragraph" w:styleId="Subtitle"><w:name w:val="Subtitle"/><w:basedOn w:val="Normal"/>"#,
    r#"<w:rPr><w:i/><w:color w:val="595959"/><w:sz w:val="28"/></w:rPr></w:style>"#,
    r#"<w:style w:type="paragraph" w:styleId="Heading1"><w:name w:val="heading 1"/><w:basedOn w:val="Normal"/>"#,
    r#"<w:pPr><w:keepNext/><w:spacing w:before="360" w:after="120"/><w:outlineLvl w:val="0"/></w:pPr>"#,
    r#"<w:rPr><w:b/><w:color w:val="2E74B5"/><w:sz w:val="32"/></w:rPr></w:style>"#,
    r#"<w:style w:type="paragraph" w:styleId="Heading2"><w:name w:val="heading 2"/><w:basedOn w:val="Normal"/>"#,
    r#"<w:pPr><w:keepNext/><w:spacing w:before="240" w:after="80"/><w:outlineLvl w:val="1"/></w:pPr>"#,
    r#"<w:rPr><w:b/><w:color w:val="2E74B5"/><w:sz w:val="26"/></w:rPr></w:style>"#,
    r#"<w:style w:type="paragraph" w:styleId="Heading3"><w:name w:val="heading 3"/><w:basedOn w:val="Normal"/>"#,
    r#"<w:pPr><w:keepNext/><w:spacing w:before="200" w:after="60"/><w:outlineLvl w:val="2"/></w:pPr>"#,
    r#"<w:rPr><w:b/><w:color w:val="1F4D78"/><w:sz w:val="24"/></w:rPr></w:style>"#,
    r#"<w:style w:type="table" w:styleId="TableGrid"><w:name w:val="Table Grid"/><w:tblPr><w:tblBorders>"#,
    r#"<w:top w:val="single" w:sz="4" w:space="0" w:color="BFBFBF"/>"#,
    r#"<w:left w:val="single" w:sz="4" w:space="0" w:color="BFBFBF"/>"#,
    r#"<w:bottom w:val="single" w:sz="4" w:space="0" w:color="BFBFBF"/>"#,
    r#"<w:right w:val="single" w:sz="4" w:space="0" w:color="BFBFBF"/>"#,
    r#"<w:insideH w:val="single" w:sz="4" w:space="0" w:color="BFBFBF"/>"#,
    r#"<w:insideV w:val="single" w:sz="4" w:space="0" w:color="BFBFBF"/>"#,
    r#"</w:tblBorders><w:tblCellMar><w:left w:w="108" w:type="dxa"/><w:right w:w="108" w:type="dxa"/></w:tblCellMar></w:tblPr></w:style>"#,
    r#"</w:styles>"#
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_slug_the_title() {
        let doc = Document::new("Tech Stack: Analysis / Report");
        assert_eq!(doc.file_name_for("1.1"), "1.1-Tech-Stack-Analysis-Report.docx");
        assert_eq!(Document::new("  ").file_name_for("2"), "2.docx");
    }

    #[test]
    fn escaping_round_trips() {
        let raw = r#"a < b && c > "d" 'e'"#;
        assert_eq!(quick_xml::escape::unescape(&escape(raw)).unwrap(), raw);
        assert_eq!(escape("bell\u{7}"), "bell");
    }

    fn package_with_body(body: &str) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("word/document.xml", SimpleFileOptions::default()).unwrap();
        write!(
            zip,
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="{NS_W}"><w:body>{body}</w:body></w:document>"#
        )
        .unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn extracted_text_decodes_references_and_cdata() {
        let bytes = package_with_body(concat!(
            r#"<w:p><w:r><w:t>it&#39;s &#x26; done</w:t></w:r></w:p>"#,
            r#"<w:p/>"#,
            r#"<w:p><!-- reviewer note --><w:r><w:t xml:space="preserve">a &lt; b </w:t></w:r>"#,
            r#"<w:r><w:t><![CDATA[<raw> & more]]></w:t></w:r></w:p>"#,
        ));
        assert_eq!(extract_text(&bytes).unwrap(), vec!["it's & done", "a < b <raw> & more"]);
    }

    #[test]
    fn broken_document_part_is_an_error() {
        let bytes = package_with_body("<w:p><w:r><w:t>open</w:r></w:p>");
        assert!(extract_text(&bytes).is_err());
    }

    #[test]
    fn colors_are_normalized() {
        assert_eq!(normalize_color("#c00000").as_deref(), Some("C00000"));
        assert_eq!(normalize_color("red"), None);
    }
}
