//! Report PDF export via `printpdf`.
//!
//! A4 pages, builtin Helvetica. Each section is a bold heading followed by
//! its content flattened to indented `key: value` rows.

use std::io::BufWriter;

use printpdf::{
    BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference,
};
use serde_json::Value;
use thiserror::Error;

use crate::pipeline::analysis::title_case;
use crate::pipeline::processor::MedicalReport;

const PAGE_WIDTH: Mm = Mm(210.0);
const PAGE_HEIGHT: Mm = Mm(297.0);
const TOP: Mm = Mm(280.0);
const BOTTOM_MARGIN: Mm = Mm(20.0);
const LEFT: f32 = 20.0;
const INDENT_STEP: f32 = 5.0;
const LINE_HEIGHT: Mm = Mm(4.5);
const WRAP_CHARS: usize = 95;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("PDF font error: {0}")]
    Font(String),

    #[error("PDF save error: {0}")]
    Save(String),
}

/// One printable row: nesting depth plus text.
#[derive(Debug, PartialEq)]
struct Row {
    depth: usize,
    text: String,
}

/// Tracks the current page and cursor, adding pages as rows run past the
/// bottom margin.
struct Writer<'a> {
    doc: &'a PdfDocumentReference,
    layer: PdfLayerReference,
    y: Mm,
    font: IndirectFontRef,
    bold: IndirectFontRef,
    pages: usize,
}

impl<'a> Writer<'a> {
    fn ensure_room(&mut self, needed: Mm) {
        if self.y - needed < BOTTOM_MARGIN {
            let (page, layer) = self.doc.add_page(PAGE_WIDTH, PAGE_HEIGHT, "Layer 1");
            self.layer = self.doc.get_page(page).get_layer(layer);
            self.y = TOP;
            self.pages += 1;
        }
    }

    fn heading(&mut self, text: &str, size: f32) {
        self.ensure_room(Mm(12.0));
        self.layer.use_text(text, size, Mm(LEFT), self.y, &self.bold);
        self.y -= Mm(7.0);
    }

    fn line(&mut self, text: &str, depth: usize) {
        let x = Mm(LEFT + INDENT_STEP * depth as f32);
        let width = WRAP_CHARS.saturating_sub(depth * 3).max(20);
        for line in wrap_text(text, width) {
            self.ensure_room(LINE_HEIGHT);
            self.layer.use_text(&line, 9.0, x, self.y, &self.font);
            self.y -= LINE_HEIGHT;
        }
    }

    fn gap(&mut self, size: Mm) {
        self.y -= size;
    }
}

/// Render the report as PDF bytes.
pub fn render_report_pdf(report: &MedicalReport) -> Result<Vec<u8>, ExportError> {
    let title = format!("Medical Report: {}", report.patient_id);
    let (doc, page1, layer1) = PdfDocument::new(&title, PAGE_WIDTH, PAGE_HEIGHT, "Layer 1");
    let font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| ExportError::Font(e.to_string()))?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| ExportError::Font(e.to_string()))?;

    let mut writer = Writer {
        doc: &doc,
        layer: doc.get_page(page1).get_layer(layer1),
        y: TOP,
        font,
        bold,
        pages: 1,
    };

    writer.heading(&title, 16.0);
    writer.line(
        &format!(
            "Generated: {}",
            report.generation_timestamp.format("%Y-%m-%d %H:%M UTC")
        ),
        0,
    );
    writer.line(&format!("Documents analyzed: {}", report.files_analyzed.len()), 0);
    writer.gap(Mm(6.0));

    for (section, content) in report.medical_analysis.iter() {
        writer.heading(&section.title(), 12.0);
        for row in flatten(content) {
            writer.line(&row.text, row.depth);
        }
        writer.gap(Mm(5.0));
    }

    if !report.files_analyzed.is_empty() {
        writer.heading("Source Documents", 12.0);
        for file in &report.files_analyzed {
            writer.line(&format!("{} ({}, {})", file.field, file.kind, file.status), 0);
        }
    }

    tracing::debug!(pages = writer.pages, "Report PDF rendered");
    drop(writer);

    let mut buf = BufWriter::new(Vec::new());
    doc.save(&mut buf)
        .map_err(|e| ExportError::Save(e.to_string()))?;
    buf.into_inner()
        .map_err(|e| ExportError::Save(e.to_string()))
}

/// Flatten a section value into printable rows.
fn flatten(value: &Value) -> Vec<Row> {
    let mut rows = Vec::new();
    flatten_into(value, 0, &mut rows);
    rows
}

fn flatten_into(value: &Value, depth: usize, rows: &mut Vec<Row>) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                let label = title_case(key);
                match scalar_text(inner) {
                    Some(text) => rows.push(Row {
                        depth,
                        text: format!("{label}: {text}"),
                    }),
                    None => {
                        rows.push(Row {
                            depth,
                            text: format!("{label}:"),
                        });
                        flatten_into(inner, depth + 1, rows);
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                match scalar_text(item) {
                    Some(text) => rows.push(Row {
                        depth,
                        text: format!("- {text}"),
                    }),
                    None => flatten_into(item, depth, rows),
                }
            }
        }
        other => {
            if let Some(text) = scalar_text(other) {
                rows.push(Row { depth, text });
            }
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("n/a".into()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Array(items) if items.is_empty() => Some("none".into()),
        Value::Object(map) if map.is_empty() => Some("n/a".into()),
        _ => None,
    }
}

fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let needed = current.chars().count() + word.chars().count() + 1;
        if needed > max_chars && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}
