//! Engine facade: wires the service clients into the parser, indexing job,
//! section pipeline and job managers.
//!
//! Clients are process-wide singletons handed in once at startup; everything
//! per-request is scoped inside the managers.

use std::sync::Arc;

use crate::clients::convert::PdfConvertApi;
use crate::clients::ocr::OcrApi;
use crate::config::Config;
use crate::embeddings::{EmbeddingApi, EmbeddingClient};
use crate::error::{EngineError, Result};
use crate::indexing::FileProcessor;
use crate::llm::ChatApi;
use crate::pipeline::Pipeline;
use crate::processing::DocumentParser;
use crate::rag::Agent;
use crate::section::SectionManager;
use crate::storage::{BlobStore, FileStore, StateManager, StateStore, VectorIndex, VectorStore};

/// External collaborators the engine is built on.
pub struct EngineServices {
    pub chat: Arc<dyn ChatApi>,
    pub embeddings: Arc<dyn EmbeddingApi>,
    pub vector_store: Arc<dyn VectorStore>,
    pub file_store: Arc<dyn FileStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub state_store: Arc<dyn StateStore>,
    pub ocr: Arc<dyn OcrApi>,
    /// Optional: office uploads skip the derived display PDF without one.
    pub converter: Option<Arc<dyn PdfConvertApi>>,
}

pub struct Engine {
    config: Arc<Config>,
    index: Arc<VectorIndex>,
    sections: SectionManager,
    files: FileProcessor,
}

impl Engine {
    pub fn new(services: EngineServices, config: Config) -> Result<Self> {
        config.validate().map_err(EngineError::Validation)?;
        let config = Arc::new(config);

        let embedder = Arc::new(EmbeddingClient::new(services.embeddings, &config));
        let index = Arc::new(VectorIndex::new(
            services.vector_store,
            embedder.clone(),
            &config,
        ));
        let parser = Arc::new(DocumentParser::new(services.ocr, config.clone()));
        let agent = Arc::new(Agent::new(services.chat.clone(), config.clone()));

        let pipeline = Arc::new(Pipeline::new(
            services.chat,
            embedder,
            index.clone(),
            services.file_store.clone(),
            config.clone(),
        ));
        let state = Arc::new(StateManager::new(services.state_store, config.jobs.state_ttl));
        let sections = SectionManager::new(pipeline, state, config.clone());

        let files = FileProcessor::new(
            parser,
            agent,
            index.clone(),
            services.file_store,
            services.blob_store,
            services.converter,
            config.clone(),
        );

        Ok(Self {
            config,
            index,
            sections,
            files,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Section job manager: init / stream / abort.
    pub fn sections(&self) -> &SectionManager {
        &self.sections
    }

    /// File ingest job manager.
    pub fn files(&self) -> &FileProcessor {
        &self.files
    }

    /// Remove every indexed chunk of a file within a tenant namespace.
    pub async fn delete_file(&self, file_id: &str, namespace: &str) -> Result<usize> {
        self.index.delete_file(file_id, namespace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ocr::OcrPage;
    use crate::storage::{
        FileRecord, MemoryBlobStore, MemoryFileStore, MemoryStateStore, MemoryVectorStore,
    };
    use crate::testing::{ScriptedChat, StubEmbeddings};
    use crate::types::{OutputFormat, SectionRequest};
    use async_trait::async_trait;

    struct NoOcr;

    #[async_trait]
    impl OcrApi for NoOcr {
        async fn analyze_pdf(&self, _bytes: &[u8]) -> Result<Vec<OcrPage>> {
            Ok(Vec::new())
        }
    }

    fn engine(chat: ScriptedChat) -> (Engine, Arc<MemoryFileStore>, Arc<MemoryBlobStore>) {
        let files = Arc::new(MemoryFileStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let engine = Engine::new(
            EngineServices {
                chat: Arc::new(chat),
                embeddings: Arc::new(StubEmbeddings),
                vector_store: Arc::new(MemoryVectorStore::new()),
                file_store: files.clone(),
                blob_store: blobs.clone(),
                state_store: Arc::new(MemoryStateStore::new()),
                ocr: Arc::new(NoOcr),
                converter: None,
            },
            Config::default(),
        )
        .unwrap();
        (engine, files, blobs)
    }

    #[tokio::test]
    async fn test_ingest_then_section_run() {
        let chat = ScriptedChat::replying(&[
            // intake
            r#"{"doc_type": "10-K", "blurb": "Annual report."}"#,
            // planner
            r#"{"queries": ["revenue"]}"#,
            // generator
            "Revenue was $10M. [1]",
            // analysis
            r#"{"score": 90, "summary": "grounded", "queries": []}"#,
        ]);
        let (engine, files, blobs) = engine(chat);

        files
            .insert(FileRecord::new("f1", "notes.md", "blobs/notes.md"))
            .await
            .unwrap();
        blobs
            .upload("blobs/notes.md", b"Revenue was $10M.\n")
            .await
            .unwrap();

        engine.files().process("f1", "tenant", None, None).await.unwrap();

        let request = SectionRequest {
            section_id: "s1".to_string(),
            file_ids: vec!["f1".to_string()],
            section_name: "Revenue".to_string(),
            section_description: "Summarize revenue.".to_string(),
            template_description: "tmpl".to_string(),
            project_description: "proj".to_string(),
            output_format: OutputFormat::Text,
            dependent_section_results: None,
        };
        engine.sections().init("tenant", request).await.unwrap();
        let mut rx = engine.sections().stream("s1", "tenant").await.unwrap();

        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        let last = last.unwrap();
        assert_eq!(last.stage, crate::pipeline::Stage::Complete);
        assert!(last.details.is_some());

        // Tenant-scoped delete clears the index.
        let deleted = engine.delete_file("f1", "tenant").await.unwrap();
        assert!(deleted > 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.retrieval.top_k_per_query = 0;
        let err = Engine::new(
            EngineServices {
                chat: Arc::new(ScriptedChat::replying(&[])),
                embeddings: Arc::new(StubEmbeddings),
                vector_store: Arc::new(MemoryVectorStore::new()),
                file_store: Arc::new(MemoryFileStore::new()),
                blob_store: Arc::new(MemoryBlobStore::new()),
                state_store: Arc::new(MemoryStateStore::new()),
                ocr: Arc::new(NoOcr),
                converter: None,
            },
            config,
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
