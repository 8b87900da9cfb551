//! Per-format document readers.
//!
//! Every format reduces to one of two shapes: ordered pages of lines (text
//! documents) or per-sheet cell tables with a pipe-rendered text (tables).
//! PDFs go through the external layout service; Excel through calamine; CSV
//! through an encoding/delimiter sniffing reader; Office formats are
//! unpacked from their zip containers and sentence-split.

use calamine::{open_workbook_auto, Data, Reader};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use unicode_segmentation::UnicodeSegmentation;

use crate::clients::ocr::OcrApi;
use crate::config::Config;
use crate::error::{EngineError, ParseFailure, Result};
use crate::types::{BoundingBox, Cell, Dimensions, Line};

/// Extensions parsed as cell tables rather than line documents.
pub const TABLE_EXTENSIONS: &[&str] = &["xlsx", "xls", "csv"];

const CSV_SNIFF_BYTES: usize = 65536;

/// A page of a text document.
#[derive(Debug, Clone)]
pub struct Page {
    pub page: usize,
    pub lines: Vec<Line>,
}

/// One parsed sheet of a table document.
#[derive(Debug, Clone)]
pub struct SheetData {
    pub name: String,
    pub index: usize,
    /// Pipe-rendered text, one row per line.
    pub text: String,
    /// coordinate (`"B7"`) → cell, non-empty cells only.
    pub cells: HashMap<String, Cell>,
    pub dimensions: Dimensions,
}

/// Structured parse output, before chunking.
#[derive(Debug, Clone)]
pub enum Parsed {
    Pages(Vec<Page>),
    Sheets(Vec<SheetData>),
}

pub fn is_table_file(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    TABLE_EXTENSIONS.iter().any(|ext| lower.ends_with(&format!(".{ext}")))
}

/// Convert a 1-based column number to a spreadsheet letter (1=A, 27=AA).
pub fn col_letter(mut n: usize) -> String {
    let mut result = String::new();
    while n > 0 {
        n -= 1;
        result.insert(0, (b'A' + (n % 26) as u8) as char);
        n /= 26;
    }
    result
}

/// Inverse of `col_letter`. Unknown characters yield 0.
pub fn col_number(letters: &str) -> usize {
    letters
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .fold(0, |acc, c| acc * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1))
}

/// Convert a layout-service polygon (inches) to percent-of-page bounds.
/// Polygon points run top-left, top-right, bottom-right, bottom-left.
pub fn polygon_to_bounds(polygon: &[f64], page_width: f64, page_height: f64) -> Option<BoundingBox> {
    if polygon.len() < 8 || page_width <= 0.0 || page_height <= 0.0 {
        return None;
    }
    let left = polygon[0] / page_width * 100.0;
    let top = polygon[1] / page_height * 100.0;
    let width = (polygon[2] - polygon[0]) / page_width * 100.0;
    let height = (polygon[5] - polygon[1]) / page_height * 100.0;

    Some(BoundingBox {
        left: left.max(0.0),
        top: top.max(0.0),
        width: width.max(0.0),
        height: height.max(0.0),
    })
}

fn split_sentences(text: &str) -> Vec<String> {
    text.unicode_sentences()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct DocumentParser {
    ocr: Arc<dyn OcrApi>,
    config: Arc<Config>,
}

impl DocumentParser {
    pub fn new(ocr: Arc<dyn OcrApi>, config: Arc<Config>) -> Self {
        Self { ocr, config }
    }

    /// Parse a document into its page or sheet structure.
    pub async fn parse_document(&self, path: &Path) -> Result<Parsed> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let owned = path.to_path_buf();
        let config = self.config.clone();

        let parsed = match ext.as_str() {
            "pdf" => self.parse_pdf(path).await?,
            "xlsx" | "xls" => {
                run_blocking(move || parse_excel(&owned, &config)).await??
            }
            "csv" => run_blocking(move || parse_csv(&owned, &config)).await??,
            "md" | "markdown" => run_blocking(move || parse_markdown(&owned)).await??,
            "docx" => run_blocking(move || parse_docx(&owned)).await??,
            "pptx" => run_blocking(move || parse_pptx(&owned)).await??,
            "html" | "htm" => run_blocking(move || parse_html(&owned)).await??,
            other => {
                return Err(ParseFailure::Unsupported(format!(".{other}")).into());
            }
        };

        match &parsed {
            Parsed::Pages(pages) if pages.iter().all(|p| p.lines.is_empty()) => {
                Err(ParseFailure::EmptyDocument.into())
            }
            Parsed::Sheets(sheets) if sheets.iter().all(|s| s.cells.is_empty()) => {
                Err(ParseFailure::EmptyDocument.into())
            }
            _ => Ok(parsed),
        }
    }

    /// Text preview for the metadata intake call: the first page or sheet.
    pub fn intake_content(parsed: &Parsed) -> Result<String> {
        let content = match parsed {
            Parsed::Pages(pages) => pages
                .first()
                .map(|p| {
                    p.lines
                        .iter()
                        .map(|l| l.text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default(),
            Parsed::Sheets(sheets) => sheets.first().map(|s| s.text.clone()).unwrap_or_default(),
        };
        if content.is_empty() {
            return Err(EngineError::Validation(
                "no content to extract a preview from".to_string(),
            ));
        }
        Ok(content)
    }

    async fn parse_pdf(&self, path: &Path) -> Result<Parsed> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            EngineError::Parse(ParseFailure::Failed(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        })?;

        let ocr_pages = self.ocr.analyze_pdf(&bytes).await?;

        let mut pages = Vec::new();
        for (idx, page) in ocr_pages.iter().enumerate() {
            let lines: Vec<Line> = page
                .lines
                .iter()
                .filter(|l| !l.content.trim().is_empty())
                .map(|l| Line {
                    text: l.content.clone(),
                    bounds: polygon_to_bounds(&l.polygon, page.width, page.height),
                })
                .collect();
            if lines.is_empty() {
                continue;
            }
            pages.push(Page { page: idx + 1, lines });
        }
        Ok(Parsed::Pages(pages))
    }
}

async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Internal(format!("blocking parse task failed: {e}")))
}

/// Find the last row/col with content. Stops early after a run of
/// consecutive empty rows.
fn table_bounds(rows: &[Vec<String>], empty_row_threshold: usize) -> (usize, usize) {
    let mut max_row = 0;
    let mut max_col = 0;
    let mut empty_count = 0;

    for (row_idx, row) in rows.iter().enumerate() {
        let mut has_content = false;
        for (col_idx, value) in row.iter().enumerate() {
            if !value.trim().is_empty() {
                has_content = true;
                max_col = max_col.max(col_idx + 1);
            }
        }
        if has_content {
            max_row = row_idx + 1;
            empty_count = 0;
        } else {
            empty_count += 1;
            if empty_count >= empty_row_threshold {
                break;
            }
        }
    }

    (max_row, max_col)
}

/// Pipe-rendered text plus the coordinate→cell map.
fn table_text(rows: &[Vec<String>], max_row: usize, max_col: usize) -> (String, HashMap<String, Cell>) {
    let mut lines = Vec::with_capacity(max_row);
    let mut cells = HashMap::new();

    for row_idx in 1..=max_row {
        let row = rows.get(row_idx - 1);
        let mut values = Vec::with_capacity(max_col);
        for col_idx in 1..=max_col {
            let raw = row.and_then(|r| r.get(col_idx - 1)).map(String::as_str).unwrap_or("");
            let clean = raw.replace(['\n', '\r'], " ").trim().to_string();
            if !clean.is_empty() {
                let letter = col_letter(col_idx);
                cells.insert(
                    format!("{letter}{row_idx}"),
                    Cell {
                        value: clean.clone(),
                        row: row_idx,
                        col: letter,
                    },
                );
            }
            values.push(clean);
        }
        lines.push(values.join(" | "));
    }

    (lines.join("\n"), cells)
}

fn sheet_from_rows(
    rows: &[Vec<String>],
    name: &str,
    index: usize,
    empty_row_threshold: usize,
) -> Option<SheetData> {
    let (max_row, max_col) = table_bounds(rows, empty_row_threshold);
    if max_row == 0 || max_col == 0 {
        return None;
    }
    let (text, cells) = table_text(rows, max_row, max_col);
    Some(SheetData {
        name: name.to_string(),
        index,
        text,
        cells,
        dimensions: Dimensions { max_row, max_col },
    })
}

/// Convert a calamine cell to a clean string representation.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                (*f as i64).to_string()
            } else {
                format!("{:.4}", f)
                    .trim_end_matches('0')
                    .trim_end_matches('.')
                    .to_string()
            }
        }
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::Error(e) => format!("#ERR:{:?}", e),
        Data::DateTime(dt) => dt.to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

fn parse_excel(path: &PathBuf, config: &Config) -> Result<Parsed> {
    let mut workbook = open_workbook_auto(path).map_err(|e| {
        EngineError::Parse(ParseFailure::Failed(format!(
            "failed to open spreadsheet {}: {e}",
            path.display()
        )))
    })?;

    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    let mut sheets = Vec::new();

    for name in &sheet_names {
        let range = match workbook.worksheet_range(name) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if range.is_empty() {
            continue;
        }

        // calamine ranges start at the first used cell; pad back to A1 so
        // cell coordinates stay absolute.
        let (start_row, start_col) = range
            .start()
            .map(|(r, c)| (r as usize, c as usize))
            .unwrap_or((0, 0));

        let mut rows: Vec<Vec<String>> = vec![Vec::new(); start_row.min(config.table.max_rows_to_scan)];
        for row in range.rows() {
            if rows.len() >= config.table.max_rows_to_scan {
                break;
            }
            let mut values = vec![String::new(); start_col];
            values.extend(row.iter().map(cell_to_string));
            rows.push(values);
        }

        if let Some(sheet) = sheet_from_rows(&rows, name, sheets.len() + 1, config.table.empty_row_threshold) {
            sheets.push(sheet);
        }
    }

    if sheets.is_empty() {
        return Err(ParseFailure::EmptyDocument.into());
    }
    Ok(Parsed::Sheets(sheets))
}

/// Pick the delimiter whose count is highest and consistent over the first
/// lines of the sample.
fn sniff_delimiter(sample: &str) -> u8 {
    let candidates = [b',', b';', b'\t', b'|'];
    let lines: Vec<&str> = sample.lines().filter(|l| !l.trim().is_empty()).take(10).collect();
    if lines.is_empty() {
        return b',';
    }

    let mut best = (b',', 0usize);
    for &candidate in &candidates {
        let counts: Vec<usize> = lines
            .iter()
            .map(|l| l.bytes().filter(|&b| b == candidate).count())
            .collect();
        let min = counts.iter().copied().min().unwrap_or(0);
        if min > best.1 {
            best = (candidate, min);
        }
    }
    best.0
}

fn parse_csv(path: &PathBuf, config: &Config) -> Result<Parsed> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        EngineError::Parse(ParseFailure::Failed(format!(
            "failed to open {}: {e}",
            path.display()
        )))
    })?;

    let mut sample = vec![0u8; CSV_SNIFF_BYTES];
    let read = file.read(&mut sample).map_err(|e| {
        EngineError::Parse(ParseFailure::Failed(format!("failed to read csv sample: {e}")))
    })?;
    sample.truncate(read);

    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(&sample, read < CSV_SNIFF_BYTES);
    let encoding = detector.guess(None, true);

    let bytes = std::fs::read(path).map_err(|e| {
        EngineError::Parse(ParseFailure::Failed(format!(
            "failed to read {}: {e}",
            path.display()
        )))
    })?;
    let (decoded, _, _) = encoding.decode(&bytes);

    let sniff_len = decoded.len().min(4096);
    let delimiter = sniff_delimiter(&decoded[..sniff_len]);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(decoded.as_bytes());

    let mut rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| {
            EngineError::Parse(ParseFailure::Failed(format!("csv parse failed: {e}")))
        })?;
        rows.push(record.iter().map(str::to_string).collect());
        if rows.len() >= config.table.max_rows_to_scan {
            break;
        }
    }

    match sheet_from_rows(&rows, "Data", 1, config.table.empty_row_threshold) {
        Some(sheet) => Ok(Parsed::Sheets(vec![sheet])),
        None => Err(ParseFailure::EmptyDocument.into()),
    }
}

fn parse_markdown(path: &PathBuf) -> Result<Parsed> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Parse(ParseFailure::Failed(format!(
            "failed to read {}: {e}",
            path.display()
        )))
    })?;

    let lines: Vec<Line> = text
        .split('\n')
        .filter(|l| !l.trim().is_empty())
        .map(|l| Line {
            text: l.to_string(),
            bounds: None,
        })
        .collect();

    Ok(Parsed::Pages(vec![Page { page: 1, lines }]))
}

fn sentence_lines(text: &str) -> Vec<Line> {
    text.lines()
        .flat_map(split_sentences)
        .map(|s| Line { text: s, bounds: None })
        .collect()
}

fn read_zip_entry(archive: &mut zip::ZipArchive<std::fs::File>, name: &str) -> Result<String> {
    let mut entry = archive.by_name(name).map_err(|e| {
        EngineError::Parse(ParseFailure::Failed(format!("archive missing {name}: {e}")))
    })?;
    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .map_err(|e| EngineError::Parse(ParseFailure::Failed(format!("failed to read {name}: {e}"))))?;
    Ok(content)
}

fn open_archive(path: &PathBuf) -> Result<zip::ZipArchive<std::fs::File>> {
    let file = std::fs::File::open(path).map_err(|e| {
        EngineError::Parse(ParseFailure::Failed(format!(
            "failed to open {}: {e}",
            path.display()
        )))
    })?;
    zip::ZipArchive::new(file).map_err(|e| {
        EngineError::Parse(ParseFailure::Failed(format!(
            "failed to read {} as archive: {e}",
            path.display()
        )))
    })
}

fn parse_docx(path: &PathBuf) -> Result<Parsed> {
    let mut archive = open_archive(path)?;
    let xml = read_zip_entry(&mut archive, "word/document.xml")?;
    let text = extract_tagged_text(&xml, "<w:p", "</w:p>", "<w:t", "</w:t>");

    Ok(Parsed::Pages(vec![Page {
        page: 1,
        lines: sentence_lines(&text),
    }]))
}

fn parse_pptx(path: &PathBuf) -> Result<Parsed> {
    let mut archive = open_archive(path)?;

    let mut slides: Vec<(usize, String)> = Vec::new();
    let names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|e| e.name().to_string()))
        .collect();

    for name in names {
        if !name.starts_with("ppt/slides/slide") || !name.ends_with(".xml") {
            continue;
        }
        let number = name
            .trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<usize>()
            .unwrap_or(0);
        if let Ok(xml) = read_zip_entry(&mut archive, &name) {
            let text = extract_tagged_text(&xml, "<a:p", "</a:p>", "<a:t", "</a:t>");
            if !text.is_empty() {
                slides.push((number, text));
            }
        }
    }
    slides.sort_by_key(|(num, _)| *num);

    let markdown = slides_to_markdown(&slides);
    Ok(Parsed::Pages(markdown_slides_to_pages(&markdown)))
}

/// Render slides as markdown with slide markers.
fn slides_to_markdown(slides: &[(usize, String)]) -> String {
    slides
        .iter()
        .map(|(num, text)| format!("<!-- Slide number: {num} -->\n{text}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Split slide-marked markdown back into one page per slide.
fn markdown_slides_to_pages(markdown: &str) -> Vec<Page> {
    let mut pages = Vec::new();
    let mut current: Option<(usize, Vec<String>)> = None;

    for line in markdown.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("<!-- Slide number:") {
            if let Some((num, body)) = current.take() {
                push_slide_page(&mut pages, num, body);
            }
            let num = rest
                .trim_end_matches("-->")
                .trim()
                .parse::<usize>()
                .unwrap_or(pages.len() + 1);
            current = Some((num, Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            if !trimmed.is_empty() {
                body.push(trimmed.to_string());
            }
        }
    }
    if let Some((num, body)) = current.take() {
        push_slide_page(&mut pages, num, body);
    }
    pages
}

fn push_slide_page(pages: &mut Vec<Page>, number: usize, body: Vec<String>) {
    let lines: Vec<Line> = body
        .iter()
        .flat_map(|l| split_sentences(l))
        .map(|s| Line { text: s, bounds: None })
        .collect();
    if !lines.is_empty() {
        pages.push(Page { page: number, lines });
    }
}

fn parse_html(path: &PathBuf) -> Result<Parsed> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Parse(ParseFailure::Failed(format!(
            "failed to read {}: {e}",
            path.display()
        )))
    })?;
    let text = strip_html_tags(&raw);

    Ok(Parsed::Pages(vec![Page {
        page: 1,
        lines: sentence_lines(&text),
    }]))
}

/// Extract text from Office XML: the content of `text_open`..`text_close`
/// elements inside `para_open`..`para_close` blocks, one line per paragraph.
fn extract_tagged_text(
    xml: &str,
    para_open: &str,
    para_close: &str,
    text_open: &str,
    text_close: &str,
) -> String {
    let mut result = String::new();
    let mut pos = 0;

    while let Some(p_start) = xml[pos..].find(para_open) {
        let abs_start = pos + p_start;
        let p_end = xml[abs_start..]
            .find(para_close)
            .map(|e| abs_start + e + para_close.len())
            .unwrap_or(xml.len());

        let paragraph = &xml[abs_start..p_end];
        let mut para_text = String::new();
        let mut t_pos = 0;

        while let Some(t_start) = paragraph[t_pos..].find(text_open) {
            let abs_t = t_pos + t_start;
            let Some(tag_end) = paragraph[abs_t..].find('>') else {
                break;
            };
            let content_start = abs_t + tag_end + 1;
            match paragraph[content_start..].find(text_close) {
                Some(t_end) => {
                    para_text.push_str(&paragraph[content_start..content_start + t_end]);
                    t_pos = content_start + t_end + text_close.len();
                }
                None => {
                    t_pos = content_start;
                }
            }
        }

        if !para_text.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(&para_text);
        }
        pos = p_end;
    }

    result
}

/// Strip HTML tags and decode common entities, keeping block structure as
/// newlines and table cells as tab stops.
fn strip_html_tags(html: &str) -> String {
    let chars: Vec<char> = html.chars().collect();
    // ASCII-only lowering keeps indices aligned with `chars`.
    let lower_chars: Vec<char> = chars.iter().map(|c| c.to_ascii_lowercase()).collect();
    let len = chars.len();

    let mut result = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    let mut skip_until: Option<&str> = None;
    let mut last_was_whitespace = false;
    let mut i = 0;

    let matches_at = |haystack: &[char], at: usize, needle: &str| -> bool {
        let needle: Vec<char> = needle.chars().collect();
        at + needle.len() <= haystack.len() && haystack[at..at + needle.len()] == needle[..]
    };

    while i < len {
        if let Some(closer) = skip_until {
            if matches_at(&lower_chars, i, closer) {
                i += closer.chars().count();
                skip_until = None;
            } else {
                i += 1;
            }
            continue;
        }

        if chars[i] == '<' {
            if matches_at(&lower_chars, i, "<script") {
                skip_until = Some("</script>");
                i += 7;
                continue;
            }
            if matches_at(&lower_chars, i, "<style") {
                skip_until = Some("</style>");
                i += 6;
                continue;
            }
            in_tag = true;

            let is_block = ["<p", "<div", "<br", "<h1", "<h2", "<h3", "<h4", "<li", "<tr", "</p", "</div", "</tr"]
                .iter()
                .any(|tag| matches_at(&lower_chars, i, tag));
            if is_block && !result.is_empty() && !result.ends_with('\n') {
                result.push('\n');
                last_was_whitespace = true;
            }
            if (matches_at(&lower_chars, i, "<td") || matches_at(&lower_chars, i, "<th"))
                && !result.is_empty()
                && !result.ends_with('\n')
                && !result.ends_with('\t')
            {
                result.push('\t');
            }
            i += 1;
            continue;
        }

        if chars[i] == '>' && in_tag {
            in_tag = false;
            i += 1;
            continue;
        }

        if !in_tag {
            if chars[i] == '&' {
                let entities = [
                    ("&lt;", '<'),
                    ("&gt;", '>'),
                    ("&amp;", '&'),
                    ("&nbsp;", ' '),
                    ("&quot;", '"'),
                ];
                if let Some((entity, ch)) = entities.iter().find(|(e, _)| matches_at(&chars, i, e)) {
                    result.push(*ch);
                    last_was_whitespace = ch.is_whitespace();
                    i += entity.chars().count();
                    continue;
                }
            }

            let ch = chars[i];
            if ch.is_whitespace() {
                if !last_was_whitespace && !result.is_empty() {
                    result.push(if ch == '\n' { '\n' } else { ' ' });
                    last_was_whitespace = true;
                }
            } else {
                result.push(ch);
                last_was_whitespace = false;
            }
        }
        i += 1;
    }

    // Collapse runs of blank lines.
    let mut cleaned = String::with_capacity(result.len());
    for line in result.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !cleaned.is_empty() {
            cleaned.push('\n');
        }
        cleaned.push_str(trimmed);
    }
    cleaned
}
