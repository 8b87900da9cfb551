//! File-processing job: download → convert → parse → analyze → index → save.
//!
//! Gated by the process-wide file semaphore with a wall-clock timeout.
//! Exactly one terminal event per run. If the relational save fails after
//! vectors were indexed, the vectors are deleted best-effort before the
//! error surfaces.

use std::io::Write;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

use crate::clients::convert::PdfConvertApi;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::pipeline::CancelSignal;
use crate::processing::{is_table_file, Chunker, DocumentParser};
use crate::rag::Agent;
use crate::storage::{BlobStore, FileStore, ProcessingStatus, VectorIndex};
use crate::types::File;

/// Extensions that get a derived display PDF through the converter.
pub const CONVERTIBLE_EXTENSIONS: &[&str] = &["doc", "docx", "ppt", "pptx"];

/// Progress record for a file-processing job.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FileEvent {
    pub file_id: String,
    pub stage: String,
    pub progress: i32,
    pub message: String,
}

pub type FileEventSender = mpsc::Sender<FileEvent>;

fn is_convertible(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    CONVERTIBLE_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{ext}")))
}

async fn emit(events: Option<&FileEventSender>, file_id: &str, stage: &str, progress: i32, message: &str) {
    if let Some(sender) = events {
        let _ = sender
            .send(FileEvent {
                file_id: file_id.to_string(),
                stage: stage.to_string(),
                progress,
                message: message.to_string(),
            })
            .await;
    }
}

fn check_cancelled(cancel: Option<&CancelSignal>) -> Result<()> {
    match cancel {
        Some(signal) if signal.is_cancelled() => Err(EngineError::Cancelled),
        _ => Ok(()),
    }
}

pub struct FileProcessor {
    parser: Arc<DocumentParser>,
    chunker: Chunker,
    agent: Arc<Agent>,
    index: Arc<VectorIndex>,
    files: Arc<dyn FileStore>,
    blobs: Arc<dyn BlobStore>,
    converter: Option<Arc<dyn PdfConvertApi>>,
    gate: Arc<Semaphore>,
    config: Arc<Config>,
}

impl FileProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parser: Arc<DocumentParser>,
        agent: Arc<Agent>,
        index: Arc<VectorIndex>,
        files: Arc<dyn FileStore>,
        blobs: Arc<dyn BlobStore>,
        converter: Option<Arc<dyn PdfConvertApi>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            parser,
            chunker: Chunker::new(config.clone()),
            agent,
            index,
            files,
            blobs,
            converter,
            gate: Arc::new(Semaphore::new(config.jobs.file_processing_concurrency)),
            config,
        }
    }

    /// Run the full ingest job for one file. Terminal status and event are
    /// always written: `completed`, `cancelled`, or `error`.
    pub async fn process(
        &self,
        file_id: &str,
        namespace: &str,
        events: Option<&FileEventSender>,
        cancel: Option<&CancelSignal>,
    ) -> Result<()> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| EngineError::Internal("file gate closed".to_string()))?;

        let result = match tokio::time::timeout(
            self.config.jobs.file_timeout,
            self.process_inner(file_id, namespace, events, cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Internal(
                "file processing timed out".to_string(),
            )),
        };

        match &result {
            Ok(()) => {
                let _ = self.files.set_status(file_id, ProcessingStatus::Completed).await;
                emit(events, file_id, "completed", 100, "Done").await;
            }
            Err(EngineError::Cancelled) => {
                tracing::info!(file_id, "file processing cancelled");
                let _ = self.files.set_status(file_id, ProcessingStatus::Cancelled).await;
                emit(events, file_id, "cancelled", 0, "Cancelled").await;
            }
            Err(err) => {
                tracing::error!(file_id, error = %err, "file processing failed");
                let _ = self.files.set_status(file_id, ProcessingStatus::Failed).await;
                emit(events, file_id, "error", 0, &err.to_string()).await;
            }
        }

        result
    }

    async fn process_inner(
        &self,
        file_id: &str,
        namespace: &str,
        events: Option<&FileEventSender>,
        cancel: Option<&CancelSignal>,
    ) -> Result<()> {
        check_cancelled(cancel)?;
        self.files.set_status(file_id, ProcessingStatus::Processing).await?;

        let record = self
            .files
            .get(file_id)
            .await?
            .ok_or_else(|| EngineError::Validation(format!("file {file_id} not found")))?;
        let file_name = record.file_name.clone();
        let is_table = is_table_file(&file_name);

        emit(events, file_id, "downloading", 0, "Downloading").await;
        let bytes = self.blobs.download(&record.file_path).await?;

        let ext = std::path::Path::new(&file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_lowercase();
        let mut temp = tempfile::Builder::new()
            .suffix(&format!(".{ext}"))
            .tempfile()
            .map_err(|e| EngineError::Internal(format!("temp file creation failed: {e}")))?;
        temp.write_all(&bytes)
            .map_err(|e| EngineError::Internal(format!("temp file write failed: {e}")))?;

        emit(events, file_id, "parsing", 15, "Converting").await;
        check_cancelled(cancel)?;

        // Office uploads get a derived display PDF when a converter is wired.
        let mut pdf_bytes: Option<Vec<u8>> = None;
        if is_convertible(&file_name) {
            if let Some(converter) = &self.converter {
                pdf_bytes = Some(converter.convert(&file_name, bytes.clone()).await?);
            }
        }

        emit(events, file_id, "parsing", 35, "Parsing").await;
        check_cancelled(cancel)?;

        // Legacy binary formats have no native reader; their converted PDF
        // goes through the layout service instead.
        let mut converted_temp = None;
        if matches!(ext.as_str(), "doc" | "ppt") {
            if let Some(pdf) = &pdf_bytes {
                let mut converted = tempfile::Builder::new()
                    .suffix(".pdf")
                    .tempfile()
                    .map_err(|e| EngineError::Internal(format!("temp file creation failed: {e}")))?;
                converted
                    .write_all(pdf)
                    .map_err(|e| EngineError::Internal(format!("temp file write failed: {e}")))?;
                converted_temp = Some(converted);
            }
        }
        let parse_path = converted_temp
            .as_ref()
            .map(|t| t.path())
            .unwrap_or_else(|| temp.path());

        let parsed = self.parser.parse_document(parse_path).await?;
        let intake = DocumentParser::intake_content(&parsed)?;

        emit(events, file_id, "analyzing", 55, "Analyzing").await;
        check_cancelled(cancel)?;
        let meta = self.agent.intake(&intake, &file_name).await;

        emit(events, file_id, "uploading", 70, "Indexing").await;
        check_cancelled(cancel)?;
        let parse = self.chunker.build(
            &parsed,
            &File {
                id: file_id.to_string(),
                name: file_name.clone(),
            },
        );
        self.index.upsert_chunks(&parse.chunks, namespace, &meta).await?;

        emit(events, file_id, "finalizing", 85, "Saving").await;
        check_cancelled(cancel)?;

        let display_path = match pdf_bytes {
            Some(pdf) => {
                let path = format!("{}.pdf", record.file_path);
                self.blobs.upload(&path, &pdf).await?;
                Some(path)
            }
            None => None,
        };

        let sheets = is_table.then_some(&parse.sheets);
        if let Err(err) = self
            .files
            .save_results(file_id, &meta, display_path.as_deref(), &parse.content, sheets)
            .await
        {
            // Vectors are already indexed; remove them so a failed save does
            // not leave orphaned chunks behind. Best effort.
            if let Err(cleanup) = self.index.delete_file(file_id, namespace).await {
                tracing::error!(file_id, error = %cleanup, "compensating vector cleanup failed");
            }
            return Err(err);
        }

        Ok(())
    }
}
