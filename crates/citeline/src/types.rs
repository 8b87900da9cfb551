//! Core data types for the parse → retrieve → generate → cite pipeline.
//!
//! Lifecycle:
//! 1. Parsing: a file becomes `Parse { chunks, content, sheets }` where every
//!    `Unit` is an atomic citable piece (a line of text or a spreadsheet cell).
//! 2. Retrieval: vector search returns `Match`es (chunks with a score).
//! 3. Generation: the numbered context produces a `Response` whose items carry
//!    raw bracket tags.
//! 4. Citation: tags are resolved through `Source` entries into scored
//!    `Citation`s, combined with an `Analysis` into the final `Outcome`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Normalized bounding box as percentages (0-100) of page dimensions.
///
/// Coordinates are viewport-independent, derived from the layout service's
/// polygon output. Used to highlight cited lines in the original document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// A line of text with an optional bounding box.
///
/// PDFs get bounds from the layout service; other formats have none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Line {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<BoundingBox>,
}

/// Position in the source document: page for text documents,
/// sheet/row/col for tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Location {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub col: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<BoundingBox>,
}

/// Source document reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    pub name: String,
}

/// Document metadata inferred by the model during ingest. All fields optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blurb: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Text,
    Table,
}

/// Atomic content piece, one line of text or one cell.
///
/// Ids are stable within a file: positive integers for text lines,
/// spreadsheet coordinates (`"B7"`) for cells. Units are created at parse
/// time and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: UnitKind,
    pub text: String,
    pub location: Location,
}

/// Spreadsheet sheet dimensions (last row/col with content).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub max_row: usize,
    pub max_col: usize,
}

/// Spreadsheet cell with its position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub value: String,
    pub row: usize,
    pub col: String,
}

/// Full spreadsheet retained for recovering truncated table chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sheet {
    pub cells: HashMap<String, Cell>,
    pub dimensions: Dimensions,
    pub tokens: usize,
}

/// Table chunk marker: names the sheet and whether the chunk's unit list is
/// only a prefix of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
    pub sheet: String,
    #[serde(default)]
    pub truncated: bool,
}

/// Group of units indexed together under a single embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub file: File,
    pub units: Vec<Unit>,
    pub tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slice: Option<Slice>,
}

/// Complete parse output for one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Parse {
    pub chunks: Vec<Chunk>,
    /// unit id → Unit lookup, persisted for citation resolution.
    pub content: HashMap<String, Unit>,
    /// sheet name → full sheet, persisted for truncated-table recovery.
    #[serde(default)]
    pub sheets: HashMap<String, Sheet>,
}

/// Chunk returned from vector search with a similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub score: f32,
    pub file: File,
    pub units: Vec<Unit>,
    pub tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slice: Option<Slice>,
    pub meta: Meta,
}

/// Section-scoped lookup from the global id the generator cites back to the
/// unit, file and metadata it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub unit: Unit,
    pub file: File,
    pub meta: Meta,
}

/// Response item with citation tags. Tags hold raw bracket contents until
/// citation scoring rewrites them to citation ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub text: String,
    pub tags: Vec<String>,
}

/// Table/chart row of items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    pub cells: Vec<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
    Pie,
    Area,
}

impl ChartKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "line" => Self::Line,
            "pie" => Self::Pie,
            "area" => Self::Area,
            _ => Self::Bar,
        }
    }
}

/// Generated answer in one of the three output shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    Text { items: Vec<Item> },
    Table { rows: Vec<Row> },
    Chart { rows: Vec<Row>, chart: ChartKind },
}

/// Requested output shape for a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Table,
    Chart,
}

/// Scored citation: a group of source units linked to one generated item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub units: Vec<Unit>,
    pub file: File,
    pub score: f32,
}

/// Response-quality analysis from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub score: i32,
    pub summary: String,
    pub queries: Vec<String>,
}

impl Analysis {
    pub fn failed() -> Self {
        Self {
            score: 0,
            summary: "Analysis failed".to_string(),
            queries: Vec::new(),
        }
    }
}

/// Complete section result persisted after a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub response: Response,
    pub citations: HashMap<String, Citation>,
    pub analysis: Analysis,
}

/// Result of an earlier section this one depends on, folded into the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependentSection {
    pub section_id: String,
    pub section_name: String,
    pub section_type: OutputFormat,
    pub response: String,
}

/// Everything needed to run one section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionRequest {
    pub section_id: String,
    pub file_ids: Vec<String>,
    pub section_name: String,
    pub section_description: String,
    pub template_description: String,
    pub project_description: String,
    pub output_format: OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependent_section_results: Option<Vec<DependentSection>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_serde_roundtrip() {
        let response = Response::Chart {
            rows: vec![Row {
                cells: vec![Item {
                    text: "Revenue".to_string(),
                    tags: vec!["12".to_string()],
                }],
            }],
            chart: ChartKind::Line,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "chart");
        assert_eq!(json["chart"], "line");

        let back: Response = serde_json::from_value(json).unwrap();
        match back {
            Response::Chart { rows, chart } => {
                assert_eq!(chart, ChartKind::Line);
                assert_eq!(rows[0].cells[0].tags, vec!["12"]);
            }
            _ => panic!("expected chart variant"),
        }
    }

    #[test]
    fn test_unit_kind_serializes_lowercase() {
        let unit = Unit {
            id: "B7".to_string(),
            kind: UnitKind::Table,
            text: "42".to_string(),
            location: Location {
                sheet: Some("Revenue".to_string()),
                row: Some(7),
                col: Some("B".to_string()),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&unit).unwrap();
        assert_eq!(json["type"], "table");
        assert!(json.get("page").is_none());
    }

    #[test]
    fn test_chart_kind_parse_defaults_to_bar() {
        assert_eq!(ChartKind::parse("pie"), ChartKind::Pie);
        assert_eq!(ChartKind::parse("histogram"), ChartKind::Bar);
        assert_eq!(ChartKind::parse(""), ChartKind::Bar);
    }
}
