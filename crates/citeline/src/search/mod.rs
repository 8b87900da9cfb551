//! Retrieval planning and search fan-out.
//!
//! The planner asks the model for a minimal diverse query set (1-8). The
//! executor runs every query against the vector store in parallel and
//! deduplicates the combined matches by chunk id, keeping the maximum score
//! seen for each.

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::llm::{temperature_for, ChatApi, ChatRequest};
use crate::rag::agent::SectionMeta;
use crate::rag::prompts::{self, SectionPromptInputs};
use crate::storage::VectorIndex;
use crate::types::Match;

const MAX_PLANNED_QUERIES: usize = 8;

pub struct Planner {
    chat: Arc<dyn ChatApi>,
    config: Arc<Config>,
}

impl Planner {
    pub fn new(chat: Arc<dyn ChatApi>, config: Arc<Config>) -> Self {
        Self { chat, config }
    }

    /// Plan retrieval queries for a section. Raises `NoQueries` when the
    /// model returns none; callers never retry this.
    pub async fn plan(&self, section: &SectionMeta) -> Result<Vec<String>> {
        if section.name.trim().is_empty() {
            return Err(EngineError::Validation("section name cannot be empty".to_string()));
        }
        if section.description.trim().is_empty() {
            return Err(EngineError::Validation(
                "section description cannot be empty".to_string(),
            ));
        }

        let date = Utc::now().format("%B %d, %Y").to_string();
        let system = prompts::planner_prompt(&SectionPromptInputs {
            section_name: &section.name,
            section_description: &section.description,
            template_description: &section.template_description,
            project_description: &section.project_description,
            context_date: &date,
        });

        let content = self
            .chat
            .complete(ChatRequest {
                model: self.config.ai.model.clone(),
                system,
                user: "Plan retrieval.".to_string(),
                temperature: temperature_for(&self.config.ai.model, self.config.ai.temperature),
                json_mode: true,
                timeout: self.config.ai.timeout,
            })
            .await?;

        let parsed: Value = serde_json::from_str(&content)
            .map_err(|e| EngineError::Ai(format!("planner returned malformed JSON: {e}")))?;

        let queries: Vec<String> = parsed
            .get("queries")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if queries.is_empty() {
            return Err(EngineError::NoQueries);
        }

        let mut queries = queries;
        queries.truncate(MAX_PLANNED_QUERIES);
        tracing::info!(count = queries.len(), section = %section.name, "planned retrieval queries");
        Ok(queries)
    }
}

pub struct Searcher {
    index: Arc<VectorIndex>,
    top_k_per_query: usize,
}

impl Searcher {
    pub fn new(index: Arc<VectorIndex>, config: &Config) -> Self {
        Self {
            index,
            top_k_per_query: config.retrieval.top_k_per_query,
        }
    }

    /// Fan out one search per query. Parallelism is bounded by the shared
    /// embedding client; no extra gate here.
    pub async fn run(&self, queries: &[String], file_ids: &[String]) -> Result<Vec<Match>> {
        let searches = queries
            .iter()
            .map(|query| self.index.search(query, file_ids, self.top_k_per_query, None));

        let mut all = Vec::new();
        for result in join_all(searches).await {
            all.extend(result?);
        }
        tracing::info!(matches = all.len(), queries = queries.len(), "search fan-out complete");
        Ok(all)
    }

    /// Collapse matches by chunk id, keeping the maximum observed score.
    /// Output order is unspecified; the context builder orders later.
    pub fn deduplicate(matches: Vec<Match>) -> Vec<Match> {
        let mut by_id: HashMap<String, Match> = HashMap::new();
        for m in matches {
            match by_id.get_mut(&m.id) {
                Some(existing) => {
                    if m.score > existing.score {
                        *existing = m;
                    }
                }
                None => {
                    by_id.insert(m.id.clone(), m);
                }
            }
        }
        by_id.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbeddingApi, EmbeddingClient};
    use crate::storage::{MemoryVectorStore, VectorStore};
    use crate::testing::{ScriptedChat, StubEmbeddings};
    use crate::types::{File, Meta, Unit};

    fn section() -> SectionMeta {
        SectionMeta {
            name: "Revenue".to_string(),
            description: "Quarterly revenue trends.".to_string(),
            template_description: "tmpl".to_string(),
            project_description: "proj".to_string(),
        }
    }

    fn planner(chat: ScriptedChat) -> Planner {
        Planner::new(Arc::new(chat), Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn test_plan_parses_queries() {
        let planner = planner(ScriptedChat::replying(&[
            r#"{"queries": ["Q2 2024 revenue", "Q2 2023 revenue"]}"#,
        ]));
        let queries = planner.plan(&section()).await.unwrap();
        assert_eq!(queries, vec!["Q2 2024 revenue", "Q2 2023 revenue"]);
    }

    #[tokio::test]
    async fn test_plan_empty_is_no_queries() {
        let planner = planner(ScriptedChat::replying(&[r#"{"queries": []}"#]));
        assert!(matches!(
            planner.plan(&section()).await.unwrap_err(),
            EngineError::NoQueries
        ));

        let planner = planner_missing_key();
        assert!(matches!(
            planner.plan(&section()).await.unwrap_err(),
            EngineError::NoQueries
        ));
    }

    fn planner_missing_key() -> Planner {
        planner(ScriptedChat::replying(&[r#"{"other": 1}"#]))
    }

    #[tokio::test]
    async fn test_plan_caps_at_eight() {
        let many: Vec<String> = (0..12).map(|i| format!("\"query {i}\"")).collect();
        let body = format!(r#"{{"queries": [{}]}}"#, many.join(","));
        let planner = planner(ScriptedChat::replying(&[&body]));
        let queries = planner.plan(&section()).await.unwrap();
        assert_eq!(queries.len(), 8);
    }

    #[tokio::test]
    async fn test_plan_validates_section() {
        let planner = planner(ScriptedChat::replying(&["{}"]));
        let mut s = section();
        s.description = " ".to_string();
        assert!(matches!(
            planner.plan(&s).await.unwrap_err(),
            EngineError::Validation(_)
        ));
    }

    fn match_with(id: &str, score: f32) -> Match {
        Match {
            id: id.to_string(),
            score,
            file: File {
                id: "f1".to_string(),
                name: "f1.pdf".to_string(),
            },
            units: Vec::<Unit>::new(),
            tokens: 10,
            slice: None,
            meta: Meta::default(),
        }
    }

    #[test]
    fn test_deduplicate_keeps_max_score() {
        let matches = vec![
            match_with("a", 0.4),
            match_with("b", 0.7),
            match_with("a", 0.9),
            match_with("a", 0.2),
        ];
        let deduped = Searcher::deduplicate(matches);
        assert_eq!(deduped.len(), 2);
        let a = deduped.iter().find(|m| m.id == "a").unwrap();
        assert_eq!(a.score, 0.9);
    }

    #[tokio::test]
    async fn test_fan_out_searches_all_queries() {
        let store = Arc::new(MemoryVectorStore::new());
        let config = Config::default();
        let embedder = Arc::new(EmbeddingClient::new(Arc::new(StubEmbeddings), &config));

        // Seed two documents directly.
        for (i, text) in ["revenue growth", "margin expansion"].iter().enumerate() {
            let doc = crate::storage::VectorDoc {
                id: format!("f1_{i}"),
                embedding: StubEmbeddings
                    .embed("m", &[text.to_string()])
                    .await
                    .unwrap()
                    .remove(0),
                units: vec![],
                tokens: 5,
                file_id: "f1".to_string(),
                file_name: "f1.pdf".to_string(),
                chunk_index: i,
                namespace: "t".to_string(),
                company: None,
                ticker: None,
                doc_type: None,
                period_label: None,
                blurb: None,
                sheet: None,
                truncated: None,
            };
            store.insert_many(&[doc]).await.unwrap();
        }

        let index = Arc::new(VectorIndex::new(store, embedder, &config));
        let searcher = Searcher::new(index, &config);

        let matches = searcher
            .run(
                &["revenue".to_string(), "margin".to_string()],
                &["f1".to_string()],
            )
            .await
            .unwrap();
        // Two queries × two stored chunks, before dedup.
        assert_eq!(matches.len(), 4);
        let deduped = Searcher::deduplicate(matches);
        assert_eq!(deduped.len(), 2);
    }
}
