//! Token-budgeted chunking of parsed documents.
//!
//! Text documents: units are packed sequentially into chunks of at most
//! `parse.max_tokens` tokens; consecutive chunks share a whole-unit overlap
//! of at least `parse.overlap_tokens`. A single unit longer than the budget
//! is split into synthetic units before packing.
//!
//! Table documents: one chunk per sheet. A sheet over the table budget keeps
//! a leading prefix of its cells and is marked truncated; the full sheet is
//! retained alongside for recovery at context-build time.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::processing::parser::{col_number, Page, Parsed, SheetData};
use crate::tokenizer;
use crate::types::{Chunk, File, Location, Parse, Sheet, Slice, Unit, UnitKind};

pub struct Chunker {
    config: Arc<Config>,
}

impl Chunker {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Build the full parse output for one document.
    pub fn build(&self, parsed: &Parsed, file: &File) -> Parse {
        match parsed {
            Parsed::Pages(pages) => self.build_text_chunks(pages, file),
            Parsed::Sheets(sheets) => self.build_table_chunks(sheets, file),
        }
    }

    fn build_text_chunks(&self, pages: &[Page], file: &File) -> Parse {
        let max_tokens = self.config.parse.max_tokens;
        let overlap_tokens = self.config.parse.overlap_tokens;

        let mut content: HashMap<String, Unit> = HashMap::new();
        let mut all_units: Vec<(Unit, usize)> = Vec::new();
        let mut unit_num = 1usize;

        for page in pages {
            for line in &page.lines {
                let location = Location {
                    page: Some(page.page),
                    bounds: line.bounds.clone(),
                    ..Default::default()
                };
                for text in split_oversized(&line.text, max_tokens) {
                    let tokens = tokenizer::count(&text);
                    let unit = Unit {
                        id: unit_num.to_string(),
                        kind: UnitKind::Text,
                        text,
                        location: location.clone(),
                    };
                    content.insert(unit.id.clone(), unit.clone());
                    all_units.push((unit, tokens));
                    unit_num += 1;
                }
            }
        }

        if all_units.is_empty() {
            return Parse::default();
        }

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut idx = 0usize;

        while idx < all_units.len() {
            let start_idx = idx;
            let mut chunk_units: Vec<Unit> = Vec::new();
            let mut chunk_tokens = 0usize;

            while idx < all_units.len() {
                let (unit, tokens) = &all_units[idx];
                if chunk_tokens + tokens > max_tokens && !chunk_units.is_empty() {
                    break;
                }
                chunk_units.push(unit.clone());
                chunk_tokens += tokens;
                idx += 1;
            }

            if !chunk_units.is_empty() {
                chunks.push(Chunk {
                    file: file.clone(),
                    units: chunk_units,
                    tokens: chunk_tokens,
                    slice: None,
                });
            }

            // Backtrack whole units until the overlap budget is covered.
            // The final chunk has no successor and skips this.
            if idx < all_units.len() {
                let mut overlap = 0usize;
                let mut back = idx;
                while back > start_idx + 1 {
                    back -= 1;
                    overlap += all_units[back].1;
                    if overlap >= overlap_tokens {
                        break;
                    }
                }
                idx = back;
            }
        }

        Parse {
            chunks,
            content,
            sheets: HashMap::new(),
        }
    }

    fn build_table_chunks(&self, sheet_data: &[SheetData], file: &File) -> Parse {
        let budget = self.config.table.max_tokens_per_chunk;

        let mut content: HashMap<String, Unit> = HashMap::new();
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut sheets: HashMap<String, Sheet> = HashMap::new();

        for data in sheet_data {
            let mut units: Vec<Unit> = data
                .cells
                .iter()
                .map(|(coord, cell)| Unit {
                    id: coord.clone(),
                    kind: UnitKind::Table,
                    text: cell.value.clone(),
                    location: Location {
                        sheet: Some(data.name.clone()),
                        row: Some(cell.row),
                        col: Some(cell.col.clone()),
                        ..Default::default()
                    },
                })
                .collect();
            units.sort_by_key(|u| {
                (
                    u.location.row.unwrap_or(0),
                    col_number(u.location.col.as_deref().unwrap_or("")),
                )
            });

            for unit in &units {
                content.insert(unit.id.clone(), unit.clone());
            }

            let sheet_tokens = tokenizer::count(&data.text);
            sheets.insert(
                data.name.clone(),
                Sheet {
                    cells: data.cells.clone(),
                    dimensions: data.dimensions,
                    tokens: sheet_tokens,
                },
            );

            let (chunk_units, tokens, truncated) = if sheet_tokens > budget {
                let (truncated_units, total) = truncate_units(&units, budget);
                (truncated_units, total, true)
            } else {
                (units, sheet_tokens, false)
            };

            chunks.push(Chunk {
                file: file.clone(),
                units: chunk_units,
                tokens,
                slice: Some(Slice {
                    sheet: data.name.clone(),
                    truncated,
                }),
            });
        }

        Parse {
            chunks,
            content,
            sheets,
        }
    }
}

/// Leading prefix of units whose cumulative tokens fit the budget. Always
/// keeps at least one unit.
fn truncate_units(units: &[Unit], max_tokens: usize) -> (Vec<Unit>, usize) {
    let mut result = Vec::new();
    let mut total = 0usize;
    for unit in units {
        let tokens = tokenizer::count(&unit.text);
        if total + tokens > max_tokens && !result.is_empty() {
            break;
        }
        result.push(unit.clone());
        total += tokens;
    }
    (result, total)
}

/// Split a text longer than `max_tokens` into token-sliced pieces; anything
/// within budget passes through unchanged. Slices that land inside a
/// multi-byte character fall back to proportional character slicing.
fn split_oversized(text: &str, max_tokens: usize) -> Vec<String> {
    let token_ids = tokenizer::encode(text);
    if token_ids.len() <= max_tokens {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::with_capacity(token_ids.len().div_ceil(max_tokens));
    for (i, slice) in token_ids.chunks(max_tokens).enumerate() {
        let decoded = tokenizer::decode(slice);
        if !decoded.is_empty() {
            pieces.push(decoded);
        } else {
            // Boundary fell inside a character; approximate by chars.
            let chars: Vec<char> = text.chars().collect();
            let per_piece = chars.len().div_ceil(token_ids.len().div_ceil(max_tokens));
            let start = (i * per_piece).min(chars.len());
            let end = ((i + 1) * per_piece).min(chars.len());
            if start < end {
                pieces.push(chars[start..end].iter().collect());
            }
        }
    }
    pieces.retain(|p| !p.trim().is_empty());
    if pieces.is_empty() {
        vec![text.to_string()]
    } else {
        pieces
    }
}
