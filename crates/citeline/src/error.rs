//! Error taxonomy for the engine.
//!
//! Local recovery is deliberately narrow: embedding rate-limit retry,
//! duplicate-key fallback on upsert, per-group citation scoring degradation,
//! and analysis degradation. Everything else surfaces to the orchestrator,
//! which emits a terminal error event and abandons the run.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Why a document could not be parsed. Fatal for the current file.
#[derive(Debug, Error)]
pub enum ParseFailure {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("document parsing failed: {0}")]
    Failed(String),
    #[error("document contained no extractable content")]
    EmptyDocument,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller-supplied input is invalid (empty queries, bad top_k, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// Tenant mismatch on a session or stream.
    #[error("access denied: {0}")]
    Auth(String),

    #[error(transparent)]
    Parse(#[from] ParseFailure),

    /// LLM or embedding call failed, or returned malformed output that could
    /// not be surfaced.
    #[error("ai service error: {0}")]
    Ai(String),

    /// The retrieval planner returned an empty query list.
    #[error("retrieval planner returned no queries")]
    NoQueries,

    /// Vector store failure.
    #[error("retrieval error: {0}")]
    Retrieval(String),

    /// Blob or relational store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Third-party service (search provider, crawler, converter) failure.
    #[error("external service error: {0}")]
    External(String),

    /// Explicit caller cancellation.
    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stage label used in terminal progress events.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_failure_converts() {
        let err: EngineError = ParseFailure::Unsupported(".zip".to_string()).into();
        assert!(matches!(err, EngineError::Parse(ParseFailure::Unsupported(_))));
        assert!(err.to_string().contains(".zip"));
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(EngineError::Cancelled.is_cancellation());
        assert!(!EngineError::NoQueries.is_cancellation());
    }
}
