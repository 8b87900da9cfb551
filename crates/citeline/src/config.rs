//! Process-wide configuration.
//!
//! Defaults match the documented constants; any of them can be overridden
//! through the environment variable of the same name before startup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub parse: ParseConfig,
    pub table: TableConfig,
    pub retrieval: RetrievalConfig,
    pub ai: AiConfig,
    pub index: IndexConfig,
    pub jobs: JobConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseConfig {
    /// Token budget for a text chunk.
    pub max_tokens: usize,
    /// Minimum trailing tokens shared between consecutive text chunks.
    pub overlap_tokens: usize,
    /// Byte-pair encoding name. Every budget in the system is counted with it.
    pub tokenizer_encoding: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub max_tokens_per_chunk: usize,
    /// Consecutive empty rows after which the bounds scan stops.
    pub empty_row_threshold: usize,
    pub max_rows_to_scan: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k_per_query: usize,
    pub timeout: Duration,
    pub context_max_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub model: String,
    pub small_model: String,
    pub embedding_model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub number_match_boost: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Chunks per upsert batch.
    pub batch_size: usize,
    /// Texts per embedding request.
    pub max_embedding_batch_size: usize,
    /// Pause between upsert batches.
    pub rate_limit_delay: Duration,
    /// Pause between embedding batches; doubled for the rate-limit retry.
    pub embedding_batch_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub file_processing_concurrency: usize,
    pub section_processing_concurrency: usize,
    pub section_timeout: Duration,
    pub file_timeout: Duration,
    /// TTL for durable job state.
    pub state_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parse: ParseConfig {
                max_tokens: 1024,
                overlap_tokens: 128,
                tokenizer_encoding: "cl100k_base".to_string(),
            },
            table: TableConfig {
                max_tokens_per_chunk: 7000,
                empty_row_threshold: 100,
                max_rows_to_scan: 100_000,
            },
            retrieval: RetrievalConfig {
                top_k_per_query: 50,
                timeout: Duration::from_secs(300),
                context_max_tokens: 75_000,
            },
            ai: AiConfig {
                model: "gpt-4o".to_string(),
                small_model: "gpt-4o-mini".to_string(),
                embedding_model: "text-embedding-3-small".to_string(),
                temperature: 0.0,
                timeout: Duration::from_secs(30),
                number_match_boost: 0.30,
            },
            index: IndexConfig {
                batch_size: 40,
                max_embedding_batch_size: 500,
                rate_limit_delay: Duration::from_millis(500),
                embedding_batch_delay: Duration::from_millis(50),
            },
            jobs: JobConfig {
                file_processing_concurrency: 10,
                section_processing_concurrency: 10,
                section_timeout: Duration::from_secs(300),
                file_timeout: Duration::from_secs(600),
                state_ttl: Duration::from_secs(3600),
            },
        }
    }
}

fn env_usize(name: &str, value: &mut usize) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(parsed) = raw.trim().parse() {
            *value = parsed;
        }
    }
}

fn env_f32(name: &str, value: &mut f32) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(parsed) = raw.trim().parse() {
            *value = parsed;
        }
    }
}

fn env_secs(name: &str, value: &mut Duration) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(parsed) = raw.trim().parse::<f64>() {
            *value = Duration::from_secs_f64(parsed);
        }
    }
}

fn env_string(name: &str, value: &mut String) {
    if let Ok(raw) = std::env::var(name) {
        if !raw.trim().is_empty() {
            *value = raw.trim().to_string();
        }
    }
}

impl Config {
    /// Defaults overridden by same-named environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        env_usize("PARSE_MAX_TOKENS", &mut cfg.parse.max_tokens);
        env_usize("PARSE_OVERLAP_TOKENS", &mut cfg.parse.overlap_tokens);
        env_string("PARSE_TOKENIZER_ENCODING", &mut cfg.parse.tokenizer_encoding);

        env_usize("TABLE_MAX_TOKENS_PER_CHUNK", &mut cfg.table.max_tokens_per_chunk);
        env_usize("TABLE_EMPTY_ROW_THRESHOLD", &mut cfg.table.empty_row_threshold);
        env_usize("TABLE_MAX_ROWS_TO_SCAN", &mut cfg.table.max_rows_to_scan);

        env_usize("RETRIEVAL_TOP_K_PER_QUERY", &mut cfg.retrieval.top_k_per_query);
        env_secs("RETRIEVAL_TIMEOUT_SECONDS", &mut cfg.retrieval.timeout);
        env_usize("CONTEXT_MAX_TOKENS", &mut cfg.retrieval.context_max_tokens);

        env_string("MODEL_NAME", &mut cfg.ai.model);
        env_string("SMALL_MODEL_NAME", &mut cfg.ai.small_model);
        env_string("EMBEDDING_MODEL_NAME", &mut cfg.ai.embedding_model);
        env_f32("AI_TEMPERATURE", &mut cfg.ai.temperature);
        env_secs("AI_TIMEOUT_SECONDS", &mut cfg.ai.timeout);
        env_f32("NUMBER_MATCH_BOOST", &mut cfg.ai.number_match_boost);

        env_usize("COSMOS_BATCH_SIZE", &mut cfg.index.batch_size);
        env_usize(
            "COSMOS_MAX_EMBEDDING_BATCH_SIZE",
            &mut cfg.index.max_embedding_batch_size,
        );
        env_secs("COSMOS_RATE_LIMIT_DELAY", &mut cfg.index.rate_limit_delay);
        env_secs(
            "COSMOS_EMBEDDING_BATCH_DELAY",
            &mut cfg.index.embedding_batch_delay,
        );

        env_usize(
            "FILE_PROCESSING_CONCURRENCY",
            &mut cfg.jobs.file_processing_concurrency,
        );
        env_usize(
            "SECTION_PROCESSING_CONCURRENCY",
            &mut cfg.jobs.section_processing_concurrency,
        );

        cfg
    }

    /// Reject clearly broken configurations.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.parse.max_tokens == 0 {
            return Err("parse.max_tokens must be > 0".into());
        }
        if self.parse.overlap_tokens >= self.parse.max_tokens {
            return Err("parse.overlap_tokens must be < parse.max_tokens".into());
        }
        if self.table.max_tokens_per_chunk == 0 {
            return Err("table.max_tokens_per_chunk must be > 0".into());
        }
        if self.retrieval.top_k_per_query == 0 || self.retrieval.top_k_per_query > 100 {
            return Err("retrieval.top_k_per_query must be in 1..=100".into());
        }
        if self.retrieval.context_max_tokens == 0 {
            return Err("retrieval.context_max_tokens must be > 0".into());
        }
        if self.index.batch_size == 0 || self.index.max_embedding_batch_size == 0 {
            return Err("index batch sizes must be > 0".into());
        }
        if self.jobs.section_processing_concurrency == 0
            || self.jobs.file_processing_concurrency == 0
        {
            return Err("job concurrency gates must be > 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.parse.max_tokens, 1024);
        assert_eq!(cfg.parse.overlap_tokens, 128);
        assert_eq!(cfg.table.max_tokens_per_chunk, 7000);
        assert_eq!(cfg.retrieval.context_max_tokens, 75_000);
        assert_eq!(cfg.index.batch_size, 40);
    }

    #[test]
    fn test_validate_rejects_overlap_at_max() {
        let mut cfg = Config::default();
        cfg.parse.overlap_tokens = cfg.parse.max_tokens;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_top_k() {
        let mut cfg = Config::default();
        cfg.retrieval.top_k_per_query = 101;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("PARSE_MAX_TOKENS", "2048");
        std::env::set_var("COSMOS_RATE_LIMIT_DELAY", "0.25");
        let cfg = Config::from_env();
        assert_eq!(cfg.parse.max_tokens, 2048);
        assert_eq!(cfg.index.rate_limit_delay, Duration::from_millis(250));
        std::env::remove_var("PARSE_MAX_TOKENS");
        std::env::remove_var("COSMOS_RATE_LIMIT_DELAY");
    }
}
