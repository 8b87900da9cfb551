//! Parse raw generator output into typed responses.
//!
//! Text output is split per line; bracket tags like `[12]`, `[45-47]` or
//! `[57K]` are extracted and stripped from the body. Table and chart output
//! must be a JSON object with a `rows` array. Malformed JSON is never
//! discarded: it surfaces as a one-item text response holding the raw
//! output.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::rag::agent::RawOutput;
use crate::types::{ChartKind, Item, OutputFormat, Response, Row};

/// Bracketed citation tags: a number, an optional numeric range, and an
/// optional trailing column letter for table coordinates.
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+(?:-\d+)?[A-Z]?)\]").expect("tag pattern is valid"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Parse raw output according to the requested format.
pub fn parse_response(raw: &RawOutput, output_format: OutputFormat) -> Response {
    match (output_format, raw) {
        (OutputFormat::Text, RawOutput::Text(text)) => parse_text(text),
        (OutputFormat::Text, RawOutput::Json(value)) => parse_text(&value.to_string()),
        (_, RawOutput::Malformed(text)) | (OutputFormat::Table, RawOutput::Text(text)) | (OutputFormat::Chart, RawOutput::Text(text)) => {
            // Keep the raw output visible instead of dropping it.
            Response::Text {
                items: vec![Item {
                    text: text.clone(),
                    tags: Vec::new(),
                }],
            }
        }
        (OutputFormat::Table, RawOutput::Json(value)) => Response::Table {
            rows: parse_rows(value),
        },
        (OutputFormat::Chart, RawOutput::Json(value)) => Response::Chart {
            rows: parse_rows(value),
            chart: value
                .get("suggested_chart_type")
                .and_then(Value::as_str)
                .map(ChartKind::parse)
                .unwrap_or(ChartKind::Bar),
        },
    }
}

/// One item per non-empty line, with tags extracted and stripped.
pub fn parse_text(raw: &str) -> Response {
    let mut items = Vec::new();

    for line in raw.trim().split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let tags: Vec<String> = TAG_RE
            .captures_iter(line)
            .map(|c| c[1].to_string())
            .collect();
        let stripped = TAG_RE.replace_all(line, "");
        let clean = WHITESPACE_RE.replace_all(&stripped, " ").trim().to_string();

        if !clean.is_empty() {
            items.push(Item { text: clean, tags });
        }
    }

    Response::Text { items }
}

fn parse_rows(value: &Value) -> Vec<Row> {
    let Some(rows) = value.get("rows").and_then(Value::as_array) else {
        return Vec::new();
    };

    rows.iter()
        .map(|row| Row {
            cells: row
                .get("cells")
                .and_then(Value::as_array)
                .map(|cells| {
                    cells
                        .iter()
                        .map(|cell| Item {
                            text: cell
                                .get("text")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            tags: cell
                                .get("tags")
                                .and_then(Value::as_array)
                                .map(|tags| {
                                    tags.iter()
                                        .filter_map(|t| match t {
                                            Value::String(s) => Some(s.clone()),
                                            Value::Number(n) => Some(n.to_string()),
                                            _ => None,
                                        })
                                        .collect()
                                })
                                .unwrap_or_default(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect()
}
