//! Staged section pipeline.
//!
//! plan → search → dedup → sheet recovery → context → generate → parse →
//! (score citations ∥ analyze) with fixed progress milestones. Exactly one
//! terminal signal per run: the completion milestone, an error event, or
//! cancellation propagated to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::config::Config;
use crate::embeddings::EmbeddingClient;
use crate::error::{EngineError, Result};
use crate::llm::ChatApi;
use crate::rag::{
    format_dependent_sections, format_response, parse_response, Agent, CitationScorer,
    ContextBuilder, SectionMeta, SheetsMap,
};
use crate::search::{Planner, Searcher};
use crate::storage::{FileStore, VectorIndex};
use crate::types::{Match, Outcome, SectionRequest};

/// Pipeline stages as surfaced in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Planning,
    Searching,
    Retrieving,
    Generating,
    Finalizing,
    Complete,
    Error,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Planning => "planning",
            Stage::Searching => "searching",
            Stage::Retrieving => "retrieving",
            Stage::Generating => "generating",
            Stage::Finalizing => "finalizing",
            Stage::Complete => "complete",
            Stage::Error => "error",
            Stage::Cancelled => "cancelled",
        }
    }
}

/// Structured progress record, delivered in order, at most once per
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub section_id: String,
    pub stage: Stage,
    pub progress: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub type ProgressSender = mpsc::Sender<Progress>;

/// Cooperative cancellation: a flag checked at stage boundaries plus a
/// notifier for tasks waiting on it. Idempotent.
#[derive(Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been signalled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

async fn emit(
    progress: Option<&ProgressSender>,
    section_id: &str,
    stage: Stage,
    pct: i32,
    message: &str,
    details: Option<Value>,
) {
    if let Some(sender) = progress {
        let event = Progress {
            section_id: section_id.to_string(),
            stage,
            progress: pct,
            message: message.to_string(),
            details,
        };
        // A detached consumer is not an error for the pipeline.
        let _ = sender.send(event).await;
    }
}

fn check_cancelled(cancel: Option<&CancelSignal>) -> Result<()> {
    match cancel {
        Some(signal) if signal.is_cancelled() => Err(EngineError::Cancelled),
        _ => Ok(()),
    }
}

pub struct Pipeline {
    planner: Planner,
    searcher: Searcher,
    context: ContextBuilder,
    agent: Agent,
    citations: CitationScorer,
    files: Arc<dyn FileStore>,
    config: Arc<Config>,
}

impl Pipeline {
    pub fn new(
        chat: Arc<dyn ChatApi>,
        embedder: Arc<EmbeddingClient>,
        index: Arc<VectorIndex>,
        files: Arc<dyn FileStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            planner: Planner::new(chat.clone(), config.clone()),
            searcher: Searcher::new(index, &config),
            context: ContextBuilder::new(config.clone()),
            agent: Agent::new(chat, config.clone()),
            citations: CitationScorer::new(embedder, &config),
            files,
            config,
        }
    }

    /// Run the full pipeline, reporting milestones through `progress`.
    /// Cancellation surfaces as `EngineError::Cancelled` with no error
    /// event; every other failure emits `error@-1` before propagating.
    pub async fn run_with_progress(
        &self,
        request: &SectionRequest,
        progress: Option<&ProgressSender>,
        cancel: Option<&CancelSignal>,
    ) -> Result<Outcome> {
        let started = std::time::Instant::now();
        match self.run_inner(request, progress, cancel).await {
            Ok(outcome) => {
                tracing::info!(
                    section = %request.section_name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "section pipeline completed"
                );
                Ok(outcome)
            }
            Err(EngineError::Cancelled) => {
                tracing::info!(section_id = %request.section_id, "section pipeline cancelled");
                Err(EngineError::Cancelled)
            }
            Err(err) => {
                tracing::error!(section_id = %request.section_id, error = %err, "section pipeline failed");
                emit(
                    progress,
                    &request.section_id,
                    Stage::Error,
                    -1,
                    &format!("Pipeline failed: {err}"),
                    None,
                )
                .await;
                Err(err)
            }
        }
    }

    async fn run_inner(
        &self,
        request: &SectionRequest,
        progress: Option<&ProgressSender>,
        cancel: Option<&CancelSignal>,
    ) -> Result<Outcome> {
        let section = SectionMeta {
            name: request.section_name.clone(),
            description: request.section_description.clone(),
            template_description: request.template_description.clone(),
            project_description: request.project_description.clone(),
        };
        let section_id = request.section_id.as_str();

        check_cancelled(cancel)?;
        emit(progress, section_id, Stage::Planning, 10, "Planning", None).await;

        // Everything up to the assembled context shares the retrieval
        // timeout.
        let retrieval = async {
            let queries = self.planner.plan(&section).await?;

            check_cancelled(cancel)?;
            emit(progress, section_id, Stage::Searching, 25, "Searching", None).await;
            let raw_matches = self.searcher.run(&queries, &request.file_ids).await?;

            check_cancelled(cancel)?;
            emit(progress, section_id, Stage::Retrieving, 40, "Gathering", None).await;
            let matches = Searcher::deduplicate(raw_matches);
            tracing::info!(matches = matches.len(), "deduplicated search matches");

            let sheets = self.fetch_sheets(&matches).await;
            Ok::<_, EngineError>(self.context.build(&matches, &sheets))
        };
        let (context_text, sources) = tokio::time::timeout(self.config.retrieval.timeout, retrieval)
            .await
            .map_err(|_| EngineError::Retrieval("retrieval pipeline timed out".to_string()))??;

        check_cancelled(cancel)?;
        emit(progress, section_id, Stage::Generating, 50, "Generating", None).await;

        let dependent_context = request
            .dependent_section_results
            .as_deref()
            .and_then(format_dependent_sections);
        let raw = self
            .agent
            .generate(
                &context_text,
                &section,
                request.output_format,
                dependent_context.as_deref(),
            )
            .await?;
        let mut response = parse_response(&raw, request.output_format);

        check_cancelled(cancel)?;
        emit(progress, section_id, Stage::Finalizing, 75, "Finalizing", None).await;

        let formatted = format_response(&response);
        let (citations, analysis) = tokio::join!(
            self.citations.score_response(&mut response, &sources),
            self.agent.analyze(&section, &context_text, &formatted),
        );

        let outcome = Outcome {
            response,
            citations,
            analysis,
        };

        check_cancelled(cancel)?;
        // The terminal event carries the outcome for streaming consumers.
        emit(
            progress,
            section_id,
            Stage::Complete,
            100,
            "Done",
            serde_json::to_value(&outcome).ok(),
        )
        .await;

        Ok(outcome)
    }

    /// Load full sheets for every truncated table match. Load failures are
    /// logged and the affected match falls back to its stored prefix.
    async fn fetch_sheets(&self, matches: &[Match]) -> SheetsMap {
        let mut file_ids: Vec<&str> = matches
            .iter()
            .filter(|m| m.slice.as_ref().is_some_and(|s| s.truncated))
            .map(|m| m.file.id.as_str())
            .collect();
        file_ids.sort_unstable();
        file_ids.dedup();

        let mut sheets_map = SheetsMap::new();
        for file_id in file_ids {
            match self.files.sheets(file_id).await {
                Ok(sheets) if !sheets.is_empty() => {
                    sheets_map.insert(file_id.to_string(), sheets);
                }
                Ok(_) => {
                    tracing::warn!(file_id, "truncated match but no stored sheets");
                }
                Err(err) => {
                    tracing::error!(file_id, error = %err, "failed to load sheets");
                }
            }
        }
        sheets_map
    }
}
