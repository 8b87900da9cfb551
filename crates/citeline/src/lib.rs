//! citeline: a retrieval-augmented document-analysis engine.
//!
//! Documents are parsed into citable units, chunked under token budgets,
//! embedded and indexed. An analyst-authored *section* (a named question
//! with a description and an output shape) is answered by planning queries,
//! fanning out vector search, assembling a numbered context, generating a
//! grounded response, and scoring every citation against its sources.

pub mod clients;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod indexing;
pub mod llm;
pub mod pipeline;
pub mod processing;
pub mod rag;
pub mod search;
pub mod section;
pub mod storage;
pub mod tokenizer;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use engine::{Engine, EngineServices};
pub use error::{EngineError, ParseFailure, Result};
pub use pipeline::{CancelSignal, Pipeline, Progress, Stage};
pub use section::{AbortResult, InitReceipt, SectionManager};
pub use types::{
    Analysis, Chunk, Citation, File, Match, Meta, Outcome, OutputFormat, Parse, Response,
    SectionRequest, Sheet, Source, Unit,
};
