//! Numbered-context assembly from search matches.
//!
//! Matches are selected by descending score under the context token budget,
//! then rendered grouped by file in presentation order. Every emitted unit
//! receives a global id the generator can cite; table cells of one row share
//! an integer and are distinguished by their column letter. Truncated table
//! matches are expanded back to the full sheet from the sheet store.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::processing::parser::col_number;
use crate::types::{
    Cell, DependentSection, Location, Match, OutputFormat, Response, Row, Sheet, Source, Unit,
    UnitKind,
};

/// file id → sheet name → full sheet, loaded for truncated matches.
pub type SheetsMap = HashMap<String, HashMap<String, Sheet>>;

pub struct ContextBuilder {
    config: Arc<Config>,
}

impl ContextBuilder {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Build the numbered context string and the global-id → source map.
    pub fn build(&self, matches: &[Match], sheets_map: &SheetsMap) -> (String, HashMap<String, Source>) {
        let (selected, total_tokens) = self.select_matches(matches, sheets_map);
        tracing::info!(
            selected = selected.len(),
            candidates = matches.len(),
            tokens = total_tokens,
            "selected matches for context"
        );

        let ordered = presentation_order(selected);

        let mut sources: HashMap<String, Source> = HashMap::new();
        let mut lines: Vec<String> = Vec::new();
        let mut current_file: Option<&str> = None;
        let mut current_sheet: Option<&str> = None;
        let mut seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();

        // The integer counter is shared between text lines and table rows;
        // `claimed` marks a value already handed to a table row so the next
        // row or text line advances past it.
        let mut counter = 1usize;
        let mut claimed = false;

        for m in &ordered {
            let sheet_name = m.slice.as_ref().map(|s| s.sheet.as_str());
            let units = resolve_units(m, sheets_map);
            if units.is_empty() {
                continue;
            }

            if current_file != Some(m.file.id.as_str()) {
                lines.extend(header_lines(m));
                current_file = Some(m.file.id.as_str());
                current_sheet = None;
            }

            if let Some(name) = sheet_name {
                if current_sheet != Some(name) {
                    lines.push(String::new());
                    lines.push(format!("--- Sheet: {name} ---"));
                    current_sheet = sheet_name;
                }
            }

            let mut current_row: Option<usize> = None;
            for unit in units {
                let key = (m.file.id.clone(), unit.id.clone());
                if seen.contains(&key) {
                    continue;
                }
                seen.insert(key);

                let global_id = match unit.kind {
                    UnitKind::Text => {
                        if claimed {
                            counter += 1;
                            claimed = false;
                        }
                        let id = counter.to_string();
                        counter += 1;
                        id
                    }
                    UnitKind::Table => {
                        let row = unit.location.row;
                        if row != current_row {
                            if claimed {
                                counter += 1;
                            }
                            current_row = row;
                        }
                        claimed = true;
                        format!("{counter}{}", unit.location.col.as_deref().unwrap_or(""))
                    }
                };

                match unit.kind {
                    UnitKind::Text => lines.push(format!("[{global_id}] {}", unit.text)),
                    UnitKind::Table => lines.push(format!("[{global_id}]: {}", unit.text)),
                }

                sources.insert(
                    global_id,
                    Source {
                        unit,
                        file: m.file.clone(),
                        meta: m.meta.clone(),
                    },
                );
            }
        }

        (lines.join("\n"), sources)
    }

    /// Highest scores first under the token budget. A truncated table match
    /// is costed at its full sheet size since rendering will expand it.
    /// Selection stops at the first match that does not fit.
    fn select_matches<'a>(&self, matches: &'a [Match], sheets_map: &SheetsMap) -> (Vec<&'a Match>, usize) {
        let mut by_score: Vec<&Match> = matches.iter().collect();
        by_score.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let budget = self.config.retrieval.context_max_tokens;
        let mut selected = Vec::new();
        let mut total = 0usize;

        for m in by_score {
            let tokens = effective_tokens(m, sheets_map);
            if total + tokens <= budget {
                selected.push(m);
                total += tokens;
            } else {
                break;
            }
        }

        (selected, total)
    }
}

fn effective_tokens(m: &Match, sheets_map: &SheetsMap) -> usize {
    if let Some(slice) = &m.slice {
        if slice.truncated {
            if let Some(sheet) = sheets_map.get(&m.file.id).and_then(|s| s.get(&slice.sheet)) {
                return sheet.tokens;
            }
            tracing::warn!(
                file_id = %m.file.id,
                sheet = %slice.sheet,
                "truncated match without stored sheet, using chunk tokens"
            );
        }
    }
    m.tokens
}

/// Files in descending max-score order; matches within a file in document
/// position order.
fn presentation_order(selected: Vec<&Match>) -> Vec<&Match> {
    let mut groups: Vec<(String, Vec<&Match>)> = Vec::new();
    for m in selected {
        match groups.iter_mut().find(|(id, _)| id == &m.file.id) {
            Some((_, list)) => list.push(m),
            None => groups.push((m.file.id.clone(), vec![m])),
        }
    }

    let mut keyed: Vec<(f32, Vec<&Match>)> = groups
        .into_iter()
        .map(|(_, mut list)| {
            let max_score = list.iter().map(|m| m.score).fold(0.0f32, f32::max);
            list.sort_by(|a, b| match_position(a).cmp(&match_position(b)));
            (max_score, list)
        })
        .collect();
    keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    keyed.into_iter().flat_map(|(_, list)| list).collect()
}

fn match_position(m: &Match) -> (usize, String) {
    match m.units.first() {
        Some(unit) if unit.kind == UnitKind::Text => (unit.location.page.unwrap_or(0), String::new()),
        Some(unit) => (
            unit.location.row.unwrap_or(0),
            unit.location.sheet.clone().unwrap_or_default(),
        ),
        None => (0, String::new()),
    }
}

/// Units to render for a match: its own list, or the full sheet when the
/// stored chunk was truncated.
fn resolve_units(m: &Match, sheets_map: &SheetsMap) -> Vec<Unit> {
    if let Some(slice) = &m.slice {
        if slice.truncated {
            if let Some(sheet) = sheets_map.get(&m.file.id).and_then(|s| s.get(&slice.sheet)) {
                return sheet_units(&sheet.cells, &slice.sheet);
            }
        }
    }
    m.units.clone()
}

/// Expand a sheet's cell map into row-major units.
pub fn sheet_units(cells: &HashMap<String, Cell>, sheet_name: &str) -> Vec<Unit> {
    let mut units: Vec<Unit> = cells
        .iter()
        .map(|(coord, cell)| Unit {
            id: coord.clone(),
            kind: UnitKind::Table,
            text: cell.value.clone(),
            location: Location {
                sheet: Some(sheet_name.to_string()),
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
    units
}

fn header_lines(m: &Match) -> Vec<String> {
    let mut lines = vec![String::new(), format!("### {}", m.file.name)];

    let mut parts: Vec<String> = Vec::new();
    if m.meta.company.is_some() || m.meta.ticker.is_some() {
        let company = m.meta.company.as_deref().unwrap_or_default();
        let company_str = match m.meta.ticker.as_deref() {
            Some(ticker) => format!("{company} ({ticker})"),
            None => company.to_string(),
        };
        parts.push(format!("**{company_str}**"));
    }
    if let Some(doc_type) = &m.meta.doc_type {
        parts.push(doc_type.clone());
    }
    if let Some(period) = &m.meta.period_label {
        parts.push(period.clone());
    }
    if !parts.is_empty() {
        lines.push(parts.join(" | "));
    }

    if m.file.name.starts_with("http") {
        lines.push(format!("URL: {}", m.file.name));
    }
    if let Some(blurb) = &m.meta.blurb {
        lines.push(String::new());
        lines.push(format!("Summary: {blurb}"));
    }

    lines.push(String::new());
    lines
}

/// Render a response to readable text: text items joined by newlines,
/// table/chart rows pipe-separated.
pub fn format_response(response: &Response) -> String {
    match response {
        Response::Text { items } => items
            .iter()
            .filter(|i| !i.text.is_empty())
            .map(|i| i.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        Response::Table { rows } | Response::Chart { rows, .. } => rows_to_pipes(rows),
    }
}

fn rows_to_pipes(rows: &[Row]) -> String {
    rows.iter()
        .map(|row| {
            row.cells
                .iter()
                .map(|c| c.text.as_str())
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render dependent-section results for the previous-sections prompt block.
pub fn format_dependent_sections(sections: &[DependentSection]) -> Option<String> {
    if sections.is_empty() {
        return None;
    }
    let mut lines = Vec::new();
    for section in sections {
        let mut response = section.response.trim().to_string();
        if response.is_empty() {
            continue;
        }
        if matches!(section.section_type, OutputFormat::Table | OutputFormat::Chart) {
            response = json_to_pipes(&response);
        }
        lines.push(format!("    * {}:\n{response}", section.section_name));
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Convert a serialized JSON table to pipe format; anything unparseable
/// passes through unchanged.
fn json_to_pipes(json_str: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(json_str.trim()) else {
        return json_str.to_string();
    };
    let Some(rows) = value.get("rows").and_then(|r| r.as_array()) else {
        return json_str.to_string();
    };

    let lines: Vec<String> = rows
        .iter()
        .map(|row| {
            row.get("cells")
                .and_then(|c| c.as_array())
                .map(|cells| {
                    cells
                        .iter()
                        .map(|c| c.get("text").and_then(|t| t.as_str()).unwrap_or_default())
                        .collect::<Vec<_>>()
                        .join(" | ")
                })
                .unwrap_or_default()
        })
        .collect();
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::parser::col_letter;
    use crate::tokenizer;
    use crate::types::{Dimensions, File, Item, Meta, Slice};

    fn text_match(id: &str, file_id: &str, score: f32, texts: &[(&str, usize)]) -> Match {
        let units: Vec<Unit> = texts
            .iter()
            .enumerate()
            .map(|(i, (text, page))| Unit {
                id: (i + 1).to_string(),
                kind: UnitKind::Text,
                text: text.to_string(),
                location: Location {
                    page: Some(*page),
                    ..Default::default()
                },
            })
            .collect();
        let tokens = units.iter().map(|u| tokenizer::count(&u.text)).sum();
        Match {
            id: id.to_string(),
            score,
            file: File {
                id: file_id.to_string(),
                name: format!("{file_id}.pdf"),
            },
            units,
            tokens,
            slice: None,
            meta: Meta::default(),
        }
    }

    fn builder() -> ContextBuilder {
        ContextBuilder::new(Arc::new(Config::default()))
    }

    fn builder_with_budget(budget: usize) -> ContextBuilder {
        let mut config = Config::default();
        config.retrieval.context_max_tokens = budget;
        ContextBuilder::new(Arc::new(config))
    }

    #[test]
    fn test_text_rendering_and_sources() {
        let m = text_match("c1", "f1", 0.9, &[("Revenue was $10M.", 1), ("Margin was 20%.", 1)]);
        let (context, sources) = builder().build(&[m], &HashMap::new());

        assert!(context.contains("### f1.pdf"));
        assert!(context.contains("[1] Revenue was $10M."));
        assert!(context.contains("[2] Margin was 20%."));
        assert_eq!(sources.len(), 2);
        assert_eq!(sources["1"].unit.text, "Revenue was $10M.");
    }

    #[test]
    fn test_every_source_emitted_exactly_once() {
        let m1 = text_match("c1", "f1", 0.9, &[("alpha", 1), ("beta", 1)]);
        // Overlapping chunk repeats unit 2 of the same file.
        let mut m2 = text_match("c2", "f1", 0.8, &[("beta", 1), ("gamma", 2)]);
        m2.units[0].id = "2".to_string();
        m2.units[1].id = "3".to_string();

        let (context, sources) = builder().build(&[m1, m2], &HashMap::new());

        // Each emitted bracket id maps to exactly one source and appears once.
        for id in sources.keys() {
            let needle = format!("[{id}] ");
            assert_eq!(context.matches(&needle).count(), 1, "id {id} emitted once");
        }
        // "beta" deduplicated across matches.
        assert_eq!(sources.len(), 3);
    }

    #[test]
    fn test_budget_stops_at_first_non_fitting() {
        let big = text_match("c1", "f1", 0.9, &[(&"word ".repeat(200), 1)]);
        let small = text_match("c2", "f2", 0.8, &[("tiny", 1)]);
        let tiny_tokens = small.tokens;
        let budget = big.tokens + tiny_tokens - 1;

        let (context, sources) = builder_with_budget(budget).build(&[big, small], &HashMap::new());
        // Highest score fits; the next does not, and selection stops.
        assert!(!context.contains("tiny"));
        assert_eq!(sources.len(), 1);
    }

    #[test]
    fn test_files_ordered_by_max_score() {
        let low = text_match("c1", "low", 0.3, &[("low doc line", 1)]);
        let high = text_match("c2", "high", 0.9, &[("high doc line", 1)]);

        let (context, _) = builder().build(&[low, high], &HashMap::new());
        let high_pos = context.find("### high.pdf").unwrap();
        let low_pos = context.find("### low.pdf").unwrap();
        assert!(high_pos < low_pos);
    }

    #[test]
    fn test_matches_within_file_in_page_order() {
        let later = {
            let mut m = text_match("c1", "f1", 0.9, &[("page five", 5)]);
            m.units[0].id = "50".to_string();
            m
        };
        let earlier = {
            let mut m = text_match("c2", "f1", 0.5, &[("page one", 1)]);
            m.units[0].id = "1".to_string();
            m
        };

        let (context, _) = builder().build(&[later, earlier], &HashMap::new());
        assert!(context.find("page one").unwrap() < context.find("page five").unwrap());
    }

    #[test]
    fn test_header_contains_meta_and_url() {
        let mut m = text_match("c1", "f1", 0.9, &[("body", 1)]);
        m.file.name = "https://example.com/report".to_string();
        m.meta = Meta {
            company: Some("Acme".to_string()),
            ticker: Some("ACME".to_string()),
            doc_type: Some("10-K".to_string()),
            period_label: Some("FY 2025".to_string()),
            blurb: Some("Annual report.".to_string()),
        };

        let (context, _) = builder().build(&[m], &HashMap::new());
        assert!(context.contains("### https://example.com/report"));
        assert!(context.contains("**Acme (ACME)** | 10-K | FY 2025"));
        assert!(context.contains("URL: https://example.com/report"));
        assert!(context.contains("Summary: Annual report."));
    }

    fn table_match(file_id: &str, sheet: &str, rows: usize, truncated: bool) -> Match {
        let mut cells = HashMap::new();
        for r in 1..=rows {
            for c in 1..=2usize {
                cells.insert(
                    format!("{}{r}", col_letter(c)),
                    Cell {
                        value: format!("v{r}{c}"),
                        row: r,
                        col: col_letter(c),
                    },
                );
            }
        }
        let units = sheet_units(&cells, sheet);
        Match {
            id: format!("{file_id}_0"),
            score: 0.9,
            file: File {
                id: file_id.to_string(),
                name: format!("{file_id}.xlsx"),
            },
            tokens: units.iter().map(|u| tokenizer::count(&u.text)).sum(),
            units,
            slice: Some(Slice {
                sheet: sheet.to_string(),
                truncated,
            }),
            meta: Meta::default(),
        }
    }

    #[test]
    fn test_table_rows_share_integer_ids() {
        let m = table_match("f1", "Revenue", 2, false);
        let (context, sources) = builder().build(&[m], &HashMap::new());

        assert!(context.contains("--- Sheet: Revenue ---"));
        assert!(context.contains("[1A]: v11"));
        assert!(context.contains("[1B]: v12"));
        assert!(context.contains("[2A]: v21"));
        assert!(context.contains("[2B]: v22"));
        assert_eq!(sources.len(), 4);
        assert_eq!(sources["2B"].unit.id, "B2");
    }

    #[test]
    fn test_counter_advances_between_table_and_text() {
        let table = table_match("f1", "Revenue", 1, false);
        let text = text_match("c2", "f2", 0.5, &[("after the table", 1)]);

        let (context, sources) = builder().build(&[table, text], &HashMap::new());
        // Table used counter 1; the text line must not reuse it.
        assert!(context.contains("[1A]: v11"));
        assert!(context.contains("[2] after the table"));
        assert_eq!(sources.len(), 3);
    }

    #[test]
    fn test_counter_advances_between_two_table_matches() {
        let t1 = table_match("f1", "Revenue", 1, false);
        let mut t2 = table_match("f2", "Costs", 1, false);
        t2.score = 0.5;
        t2.slice = Some(Slice {
            sheet: "Costs".to_string(),
            truncated: false,
        });

        let (_, sources) = builder().build(&[t1, t2], &HashMap::new());
        // Four distinct global ids: 1A 1B from the first sheet, 2A 2B from
        // the second. A collision would lose a source.
        assert_eq!(sources.len(), 4);
        assert!(sources.contains_key("1A"));
        assert!(sources.contains_key("2A"));
    }

    #[test]
    fn test_truncated_match_expands_full_sheet() {
        // Chunk carries only 1 row but the stored sheet has 200.
        let mut m = table_match("f1", "Revenue", 1, true);
        m.tokens = 5;

        let mut cells = HashMap::new();
        for r in 1..=200usize {
            cells.insert(
                format!("A{r}"),
                Cell {
                    value: format!("row {r}"),
                    row: r,
                    col: "A".to_string(),
                },
            );
        }
        let full_tokens: usize = cells.values().map(|c| tokenizer::count(&c.value)).sum();
        let mut sheets_map = SheetsMap::new();
        sheets_map.insert(
            "f1".to_string(),
            HashMap::from([(
                "Revenue".to_string(),
                Sheet {
                    cells,
                    dimensions: Dimensions { max_row: 200, max_col: 1 },
                    tokens: full_tokens,
                },
            )]),
        );

        let (context, sources) = builder().build(&[m], &sheets_map);
        assert_eq!(sources.len(), 200);
        assert!(context.contains("[200A]: row 200"));
    }

    #[test]
    fn test_truncated_match_costed_at_full_sheet_tokens() {
        let mut m = table_match("f1", "Revenue", 1, true);
        m.tokens = 1;

        let mut sheets_map = SheetsMap::new();
        sheets_map.insert(
            "f1".to_string(),
            HashMap::from([(
                "Revenue".to_string(),
                Sheet {
                    cells: HashMap::new(),
                    dimensions: Dimensions { max_row: 0, max_col: 0 },
                    tokens: 1_000_000,
                },
            )]),
        );

        // Full sheet exceeds the budget, so nothing is selected.
        let (context, sources) = builder_with_budget(100).build(&[m], &sheets_map);
        assert!(context.is_empty());
        assert!(sources.is_empty());
    }

    #[test]
    fn test_context_stays_under_budget() {
        let matches: Vec<Match> = (0..20)
            .map(|i| {
                text_match(
                    &format!("c{i}"),
                    &format!("f{i}"),
                    1.0 - i as f32 * 0.01,
                    &[(&format!("document line number {i} with some words"), 1)],
                )
            })
            .collect();
        let builder = builder_with_budget(50);
        let (context, _) = builder.build(&matches, &HashMap::new());
        assert!(tokenizer::count(&context) <= 50 + 60, "headers stay small");
    }

    #[test]
    fn test_format_response_text_and_table() {
        let text = Response::Text {
            items: vec![
                Item {
                    text: "one".to_string(),
                    tags: vec![],
                },
                Item {
                    text: "two".to_string(),
                    tags: vec![],
                },
            ],
        };
        assert_eq!(format_response(&text), "one\ntwo");

        let table = Response::Table {
            rows: vec![Row {
                cells: vec![
                    Item {
                        text: "a".to_string(),
                        tags: vec![],
                    },
                    Item {
                        text: "b".to_string(),
                        tags: vec![],
                    },
                ],
            }],
        };
        assert_eq!(format_response(&table), "a | b");
    }

    #[test]
    fn test_format_dependent_sections() {
        let sections = vec![
            DependentSection {
                section_id: "s1".to_string(),
                section_name: "Overview".to_string(),
                section_type: OutputFormat::Text,
                response: "Revenue grew.".to_string(),
            },
            DependentSection {
                section_id: "s2".to_string(),
                section_name: "Table".to_string(),
                section_type: OutputFormat::Table,
                response: r#"{"rows":[{"cells":[{"text":"a"},{"text":"b"}]}]}"#.to_string(),
            },
        ];
        let formatted = format_dependent_sections(&sections).unwrap();
        assert!(formatted.contains("* Overview:\nRevenue grew."));
        assert!(formatted.contains("a | b"));

        assert!(format_dependent_sections(&[]).is_none());
    }
}
