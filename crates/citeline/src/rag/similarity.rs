//! Similarity scoring between generated items and their cited sources.
//!
//! Base score is embedding cosine similarity clipped to [0, 1]. On top of it
//! sits a numeric-match boost: every number that appears in both texts with
//! the same kind and unit, within relative tolerance, adds a fixed bump.
//! `$47.5B` and `47,500,000,000 USD` count as the same number.

use regex::Regex;
use std::sync::LazyLock;

const RELATIVE_TOLERANCE: f64 = 0.01;

/// Cosine similarity clipped to [0, 1]. Zero vectors score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    sim.clamp(0.0, 1.0) as f32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberKind {
    Plain,
    Currency,
    Percentage,
}

/// A number extracted from free text, normalized to its full value.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedNumber {
    pub value: f64,
    pub kind: NumberKind,
    /// ISO currency code for currencies, `%` for percentages.
    pub unit: Option<String>,
}

impl ExtractedNumber {
    /// Same kind, same unit, value within tolerance. Zero values are
    /// compared by absolute difference.
    pub fn matches(&self, other: &ExtractedNumber, tolerance: f64) -> bool {
        if self.kind != other.kind || self.unit != other.unit {
            return false;
        }
        if self.value == 0.0 || other.value == 0.0 {
            return (self.value - other.value).abs() < tolerance;
        }
        let rel = (self.value - other.value).abs() / self.value.abs().max(other.value.abs());
        rel <= tolerance
    }
}

static CURRENCY_SYMBOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)([$€£¥])\s*([0-9][0-9,]*(?:\.[0-9]+)?)\s*(trillion|billion|million|thousand|tn|bn|mm|[kmbt])?",
    )
    .expect("currency symbol pattern is valid")
});

static CURRENCY_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)([0-9][0-9,]*(?:\.[0-9]+)?)\s*(trillion|billion|million|thousand|tn|bn|mm|[kmbt])?\s*(USD|EUR|GBP|JPY)\b",
    )
    .expect("currency code pattern is valid")
});

static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(-?[0-9][0-9,]*(?:\.[0-9]+)?)\s*(?:%|percent\b)")
        .expect("percent pattern is valid")
});

static PLAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(-?[0-9][0-9,]*(?:\.[0-9]+)?)([KMBT]\b|\s*(?:trillion|billion|million|thousand)\b)?")
        .expect("plain number pattern is valid")
});

fn scale_for(suffix: &str) -> f64 {
    match suffix.trim().to_ascii_lowercase().as_str() {
        "k" | "thousand" => 1e3,
        "m" | "mm" | "million" => 1e6,
        "b" | "bn" | "billion" => 1e9,
        "t" | "tn" | "trillion" => 1e12,
        _ => 1.0,
    }
}

fn symbol_to_iso(symbol: &str) -> &'static str {
    match symbol {
        "€" => "EUR",
        "£" => "GBP",
        "¥" => "JPY",
        _ => "USD",
    }
}

fn parse_magnitude(digits: &str) -> Option<f64> {
    digits.replace(',', "").parse::<f64>().ok()
}

fn overlaps(spans: &[(usize, usize)], start: usize, end: usize) -> bool {
    spans.iter().any(|&(s, e)| start < e && end > s)
}

/// Extract currencies, percentages and plain numbers with priority in that
/// order; a span consumed by a higher-priority kind is skipped by later
/// passes.
pub fn extract_numbers(text: &str) -> Vec<ExtractedNumber> {
    let mut numbers = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();

    for caps in CURRENCY_SYMBOL_RE.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        if overlaps(&spans, whole.start(), whole.end()) {
            continue;
        }
        if let Some(value) = parse_magnitude(&caps[2]) {
            let scale = caps.get(3).map(|m| scale_for(m.as_str())).unwrap_or(1.0);
            numbers.push(ExtractedNumber {
                value: value * scale,
                kind: NumberKind::Currency,
                unit: Some(symbol_to_iso(&caps[1]).to_string()),
            });
            spans.push((whole.start(), whole.end()));
        }
    }

    for caps in CURRENCY_CODE_RE.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        if overlaps(&spans, whole.start(), whole.end()) {
            continue;
        }
        if let Some(value) = parse_magnitude(&caps[1]) {
            let scale = caps.get(2).map(|m| scale_for(m.as_str())).unwrap_or(1.0);
            numbers.push(ExtractedNumber {
                value: value * scale,
                kind: NumberKind::Currency,
                unit: Some(caps[3].to_ascii_uppercase()),
            });
            spans.push((whole.start(), whole.end()));
        }
    }

    for caps in PERCENT_RE.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        if overlaps(&spans, whole.start(), whole.end()) {
            continue;
        }
        if let Some(value) = parse_magnitude(&caps[1]) {
            numbers.push(ExtractedNumber {
                value,
                kind: NumberKind::Percentage,
                unit: Some("%".to_string()),
            });
            spans.push((whole.start(), whole.end()));
        }
    }

    for caps in PLAIN_RE.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        if overlaps(&spans, whole.start(), whole.end()) {
            continue;
        }
        if let Some(value) = parse_magnitude(&caps[1]) {
            let scale = caps.get(2).map(|m| scale_for(m.as_str())).unwrap_or(1.0);
            numbers.push(ExtractedNumber {
                value: value * scale,
                kind: NumberKind::Plain,
                unit: None,
            });
            spans.push((whole.start(), whole.end()));
        }
    }

    numbers
}

/// Count numbers appearing in both texts, pairing greedily: each number in
/// `right` is consumed by at most one number in `left`.
pub fn count_matching_numbers(left: &str, right: &str) -> usize {
    let lhs = extract_numbers(left);
    let rhs = extract_numbers(right);

    let mut used = vec![false; rhs.len()];
    let mut matches = 0;

    for a in &lhs {
        for (i, b) in rhs.iter().enumerate() {
            if used[i] {
                continue;
            }
            if a.matches(b, RELATIVE_TOLERANCE) {
                matches += 1;
                used[i] = true;
                break;
            }
        }
    }

    matches
}

/// Base cosine scores with the numeric-match boost applied, clamped to 1.0.
pub fn score_with_boost(
    response_embedding: &[f32],
    cited_embeddings: &[Vec<f32>],
    response_text: &str,
    cited_texts: &[String],
    boost: f32,
) -> Vec<f32> {
    cited_embeddings
        .iter()
        .enumerate()
        .map(|(i, embedding)| {
            let mut score = cosine(response_embedding, embedding);
            let cited = cited_texts.get(i).map(String::as_str).unwrap_or("");
            let matched = count_matching_numbers(response_text, cited);
            if matched > 0 {
                score = (score + matched as f32 * boost).min(1.0);
            }
            score
        })
        .collect()
}
