//! Byte-pair tokenizer used for every budget enforcement in the system.
//!
//! A single fixed `cl100k_base` encoding, constructed once. Swapping the
//! encoding silently breaks the chunk, overlap and context-size invariants,
//! so nothing here is configurable at runtime.

use std::sync::LazyLock;
use tiktoken_rs::{cl100k_base, CoreBPE};

static ENCODER: LazyLock<CoreBPE> =
    LazyLock::new(|| cl100k_base().expect("cl100k_base tables are embedded in the binary"));

/// Number of tokens in `text`.
pub fn count(text: &str) -> usize {
    ENCODER.encode_ordinary(text).len()
}

/// Encode `text` to token ids.
pub fn encode(text: &str) -> Vec<usize> {
    ENCODER
        .encode_ordinary(text)
        .into_iter()
        .map(|t| t as usize)
        .collect()
}

/// Decode token ids back to text.
///
/// A slice taken at an arbitrary token boundary can split a multi-byte
/// character; such slices decode to an empty string and the caller falls
/// back to character slicing.
pub fn decode(tokens: &[usize]) -> String {
    let tokens: Vec<u32> = tokens.iter().map(|&t| t as u32).collect();
    ENCODER.decode(tokens).unwrap_or_default()
}
