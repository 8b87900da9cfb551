//! Model calls for the section pipeline: answer generation, response-quality
//! analysis, and document metadata intake.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::llm::{temperature_for, ChatApi, ChatRequest};
use crate::rag::prompts::{self, SectionPromptInputs};
use crate::types::{Analysis, Meta, OutputFormat};

/// Raw generator output before response parsing.
#[derive(Debug, Clone)]
pub enum RawOutput {
    /// Plain text, as returned for the text format.
    Text(String),
    /// Parsed JSON object for table/chart formats.
    Json(Value),
    /// The model was asked for JSON but returned something else; the raw
    /// content is preserved for inspection.
    Malformed(String),
}

/// Bundle of the section fields every prompt needs.
#[derive(Debug, Clone)]
pub struct SectionMeta {
    pub name: String,
    pub description: String,
    pub template_description: String,
    pub project_description: String,
}

impl SectionMeta {
    fn prompt_inputs<'a>(&'a self, date: &'a str) -> SectionPromptInputs<'a> {
        SectionPromptInputs {
            section_name: &self.name,
            section_description: &self.description,
            template_description: &self.template_description,
            project_description: &self.project_description,
            context_date: date,
        }
    }
}

fn context_date() -> String {
    Utc::now().format("%B %d, %Y").to_string()
}

pub struct Agent {
    chat: Arc<dyn ChatApi>,
    config: Arc<Config>,
}

impl Agent {
    pub fn new(chat: Arc<dyn ChatApi>, config: Arc<Config>) -> Self {
        Self { chat, config }
    }

    /// Generate the section answer from the numbered context.
    pub async fn generate(
        &self,
        context: &str,
        section: &SectionMeta,
        output_format: OutputFormat,
        dependent_sections_context: Option<&str>,
    ) -> Result<RawOutput> {
        if context.trim().is_empty() {
            return Err(EngineError::Validation("context cannot be empty".to_string()));
        }
        if section.name.trim().is_empty() {
            return Err(EngineError::Validation("section name cannot be empty".to_string()));
        }
        if section.description.trim().is_empty() {
            return Err(EngineError::Validation(
                "section description cannot be empty".to_string(),
            ));
        }

        let date = context_date();
        let system = prompts::section_prompt(
            &section.prompt_inputs(&date),
            context,
            output_format,
            dependent_sections_context,
        );

        let json_mode = matches!(output_format, OutputFormat::Table | OutputFormat::Chart);
        let content = self
            .chat
            .complete(ChatRequest {
                model: self.config.ai.model.clone(),
                system,
                user: format!("Extract the {}.", section.name),
                temperature: temperature_for(&self.config.ai.model, self.config.ai.temperature),
                json_mode,
                timeout: self.config.ai.timeout,
            })
            .await?;

        if content.trim().is_empty() {
            return Err(EngineError::Ai("empty response from generator".to_string()));
        }

        if !json_mode {
            return Ok(RawOutput::Text(content));
        }

        match serde_json::from_str::<Value>(&content) {
            Ok(value) if value.is_object() => Ok(RawOutput::Json(value)),
            _ => {
                tracing::error!("generator returned malformed JSON, surfacing raw output");
                Ok(RawOutput::Malformed(content))
            }
        }
    }

    /// Score the generated answer against its context with the small model.
    /// Never fails the run: any error degrades to a zero-score analysis.
    pub async fn analyze(
        &self,
        section: &SectionMeta,
        context: &str,
        formatted_response: &str,
    ) -> Analysis {
        if context.trim().is_empty() || section.name.trim().is_empty() {
            return Analysis::failed();
        }

        let date = context_date();
        let system = prompts::analysis_prompt(
            &section.prompt_inputs(&date),
            context,
            formatted_response,
        );

        let result = self
            .chat
            .complete(ChatRequest {
                model: self.config.ai.small_model.clone(),
                system: "You are an evidence auditor. Return only valid JSON.".to_string(),
                user: system,
                temperature: temperature_for(&self.config.ai.small_model, self.config.ai.temperature),
                json_mode: true,
                timeout: self.config.ai.timeout,
            })
            .await;

        match result {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(value) => {
                    let analysis = Analysis {
                        score: value
                            .get("score")
                            .and_then(Value::as_i64)
                            .unwrap_or(0)
                            .clamp(0, 100) as i32,
                        summary: value
                            .get("summary")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        queries: value
                            .get("queries")
                            .and_then(Value::as_array)
                            .map(|arr| {
                                arr.iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default(),
                    };
                    tracing::info!(section = %section.name, score = analysis.score, "response analysis");
                    analysis
                }
                Err(e) => {
                    tracing::error!("analysis returned malformed JSON: {e}");
                    Analysis::failed()
                }
            },
            Err(e) => {
                tracing::error!("analysis call failed: {e}");
                Analysis::failed()
            }
        }
    }

    /// Infer document metadata from a content preview. Degrades to a stub
    /// Meta naming the file when the call fails.
    pub async fn intake(&self, preview: &str, file_name: &str) -> Meta {
        let clipped: String = preview.chars().take(2000).collect();
        let system = prompts::intake_prompt(&clipped);

        let result = self
            .chat
            .complete(ChatRequest {
                model: self.config.ai.small_model.clone(),
                system,
                user: "Analyze this document.".to_string(),
                temperature: temperature_for(&self.config.ai.small_model, self.config.ai.temperature),
                json_mode: true,
                timeout: self.config.ai.timeout,
            })
            .await;

        let fallback = || Meta {
            doc_type: Some("other".to_string()),
            blurb: Some(format!("Document: {file_name}")),
            ..Default::default()
        };

        match result {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(value) => {
                    let field = |key: &str| {
                        value
                            .get(key)
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                    };
                    Meta {
                        company: field("company"),
                        ticker: field("ticker"),
                        doc_type: field("doc_type"),
                        period_label: field("period_label"),
                        blurb: field("blurb"),
                    }
                }
                Err(e) => {
                    tracing::error!("metadata intake returned malformed JSON: {e}");
                    fallback()
                }
            },
            Err(e) => {
                tracing::error!("metadata intake failed: {e}");
                fallback()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedChat;

    fn section() -> SectionMeta {
        SectionMeta {
            name: "Revenue".to_string(),
            description: "Summarize revenue.".to_string(),
            template_description: "tmpl".to_string(),
            project_description: "proj".to_string(),
        }
    }

    fn agent(chat: ScriptedChat) -> Agent {
        Agent::new(Arc::new(chat), Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn test_generate_text_passes_through() {
        let agent = agent(ScriptedChat::replying(&["Revenue rose. [1]"]));
        let out = agent
            .generate("[1] Revenue rose.", &section(), OutputFormat::Text, None)
            .await
            .unwrap();
        assert!(matches!(out, RawOutput::Text(t) if t.contains("Revenue rose")));
    }

    #[tokio::test]
    async fn test_generate_table_parses_json() {
        let chat = Arc::new(ScriptedChat::replying(&[r#"{"rows": []}"#]));
        let agent = Agent::new(chat.clone(), Arc::new(Config::default()));
        let out = agent
            .generate("[1] ctx", &section(), OutputFormat::Table, None)
            .await
            .unwrap();
        assert!(matches!(out, RawOutput::Json(_)));

        // Table output is requested in JSON mode with the configured timeout.
        let requests = chat.requests.lock();
        assert!(requests[0].json_mode);
        assert_eq!(requests[0].user, "Extract the Revenue.");
    }

    #[tokio::test]
    async fn test_generate_malformed_json_is_preserved() {
        let agent = agent(ScriptedChat::replying(&["not json at all"]));
        let out = agent
            .generate("[1] ctx", &section(), OutputFormat::Chart, None)
            .await
            .unwrap();
        assert!(matches!(out, RawOutput::Malformed(raw) if raw == "not json at all"));
    }

    #[tokio::test]
    async fn test_generate_validates_inputs() {
        let agent = agent(ScriptedChat::replying(&["x"]));
        assert!(matches!(
            agent.generate("", &section(), OutputFormat::Text, None).await,
            Err(EngineError::Validation(_))
        ));

        let mut empty_name = section();
        empty_name.name = "  ".to_string();
        let agent = self::agent(ScriptedChat::replying(&["x"]));
        assert!(agent
            .generate("ctx", &empty_name, OutputFormat::Text, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_analyze_parses_result() {
        let agent = agent(ScriptedChat::replying(&[
            r#"{"score": 85, "summary": "mostly grounded", "queries": ["missing margin"]}"#,
        ]));
        let analysis = agent.analyze(&section(), "ctx", "resp").await;
        assert_eq!(analysis.score, 85);
        assert_eq!(analysis.summary, "mostly grounded");
        assert_eq!(analysis.queries, vec!["missing margin"]);
    }

    #[tokio::test]
    async fn test_analyze_degrades_on_failure() {
        let agent = agent(ScriptedChat::failing("service down"));
        let analysis = agent.analyze(&section(), "ctx", "resp").await;
        assert_eq!(analysis.score, 0);
        assert_eq!(analysis.summary, "Analysis failed");
        assert!(analysis.queries.is_empty());
    }

    #[tokio::test]
    async fn test_intake_degrades_to_named_stub() {
        let agent = agent(ScriptedChat::failing("boom"));
        let meta = agent.intake("preview", "report.pdf").await;
        assert_eq!(meta.doc_type.as_deref(), Some("other"));
        assert_eq!(meta.blurb.as_deref(), Some("Document: report.pdf"));
    }

    #[tokio::test]
    async fn test_intake_parses_fields() {
        let agent = agent(ScriptedChat::replying(&[
            r#"{"company": "Acme", "ticker": "ACME", "doc_type": "10-K", "period_label": "FY 2025", "blurb": "Annual report."}"#,
        ]));
        let meta = agent.intake("preview", "report.pdf").await;
        assert_eq!(meta.company.as_deref(), Some("Acme"));
        assert_eq!(meta.period_label.as_deref(), Some("FY 2025"));
    }
}
