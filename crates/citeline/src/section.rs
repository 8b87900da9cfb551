//! Section job management: durable init, gated execution with progress
//! streaming, reconnection, and the abort contract.
//!
//! A client first initializes a job (receiving a processing id), then
//! streams it. Streaming runs the pipeline under the process-wide section
//! gate with a wall-clock timeout; progress is serialized through a single
//! queue and mirrored into the durable state store so a reconnecting client
//! can be served the stored result immediately. Cancellation is honored both
//! through the durable flag and the in-process signal.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::pipeline::{CancelSignal, Pipeline, Progress, Stage};
use crate::storage::StateManager;
use crate::types::{Outcome, SectionRequest};

const JOB_TYPE: &str = "section";
const CANCEL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Durable per-section job state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionJob {
    pub section_id: String,
    pub processing_id: String,
    pub tenant: String,
    pub request: SectionRequest,
    pub cancelled: bool,
    pub status: JobStatus,
    pub progress: i32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Outcome>,
}

#[derive(Debug, Clone)]
pub struct InitReceipt {
    pub section_id: String,
    pub processing_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortResult {
    pub success: bool,
    pub message: String,
}

pub struct SectionManager {
    pipeline: Arc<Pipeline>,
    state: Arc<StateManager>,
    gate: Arc<Semaphore>,
    running: Arc<DashMap<String, CancelSignal>>,
    config: Arc<Config>,
}

impl SectionManager {
    pub fn new(pipeline: Arc<Pipeline>, state: Arc<StateManager>, config: Arc<Config>) -> Self {
        Self {
            pipeline,
            state,
            gate: Arc::new(Semaphore::new(config.jobs.section_processing_concurrency)),
            running: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Persist the request and hand back the processing id the client needs
    /// for the stream and abort calls.
    pub async fn init(&self, tenant: &str, request: SectionRequest) -> Result<InitReceipt> {
        if tenant.trim().is_empty() {
            return Err(EngineError::Validation("tenant is required".to_string()));
        }
        if request.file_ids.is_empty() {
            return Err(EngineError::Validation("file_ids cannot be empty".to_string()));
        }

        let receipt = InitReceipt {
            section_id: request.section_id.clone(),
            processing_id: Uuid::new_v4().to_string(),
        };
        let job = SectionJob {
            section_id: request.section_id.clone(),
            processing_id: receipt.processing_id.clone(),
            tenant: tenant.to_string(),
            request,
            cancelled: false,
            status: JobStatus::Running,
            progress: 0,
            message: String::new(),
            timestamp: Utc::now(),
            result: None,
        };
        self.state
            .set_job_state(JOB_TYPE, &receipt.section_id, &job)
            .await?;

        tracing::info!(section_id = %receipt.section_id, tenant, "section processing initialized");
        Ok(receipt)
    }

    /// Latest durable job state, if any.
    pub async fn job(&self, section_id: &str) -> Result<Option<SectionJob>> {
        self.state.get_job_state(JOB_TYPE, section_id).await
    }

    /// Start (or reconnect to) a section run, returning its ordered event
    /// stream. Exactly one terminal event is delivered: `complete` (with the
    /// outcome in `details`), `cancelled`, or `error`.
    pub async fn stream(&self, section_id: &str, tenant: &str) -> Result<mpsc::Receiver<Progress>> {
        let job: SectionJob = self
            .job(section_id)
            .await?
            .ok_or_else(|| EngineError::Validation("section processing request not found".to_string()))?;
        if job.tenant != tenant {
            return Err(EngineError::Auth("access denied".to_string()));
        }

        let (tx, rx) = mpsc::channel::<Progress>(64);

        // Reconnection: a finished job is served from the stored result.
        if let Some(result) = &job.result {
            let _ = tx
                .send(Progress {
                    section_id: section_id.to_string(),
                    stage: Stage::Complete,
                    progress: 100,
                    message: "Complete".to_string(),
                    details: serde_json::to_value(result).ok(),
                })
                .await;
            return Ok(rx);
        }
        if job.cancelled {
            let _ = tx.send(cancelled_event(section_id)).await;
            return Ok(rx);
        }

        let cancel = CancelSignal::new();
        self.running.insert(section_id.to_string(), cancel.clone());

        let pipeline = self.pipeline.clone();
        let state = self.state.clone();
        let gate = self.gate.clone();
        let running = self.running.clone();
        let timeout = self.config.jobs.section_timeout;
        let section_id = section_id.to_string();
        let processing_id = job.processing_id.clone();
        let request = job.request.clone();

        tokio::spawn(async move {
            let Ok(_permit) = gate.acquire().await else {
                return;
            };

            // Mirror pipeline progress into durable state on its way to the
            // consumer, keeping events totally ordered through one queue.
            let (ptx, mut prx) = mpsc::channel::<Progress>(64);
            let forwarder = {
                let state = state.clone();
                let tx = tx.clone();
                let section_id = section_id.clone();
                tokio::spawn(async move {
                    while let Some(event) = prx.recv().await {
                        if let Ok(Some(mut job)) =
                            state.get_job_state::<SectionJob>(JOB_TYPE, &section_id).await
                        {
                            job.progress = event.progress;
                            job.message = event.message.clone();
                            let _ = state.set_job_state(JOB_TYPE, &section_id, &job).await;
                        }
                        let _ = tx.send(event).await;
                    }
                })
            };

            // Backup watcher for the durable cancellation flag (an abort may
            // come from another process sharing the state store).
            let watcher = {
                let state = state.clone();
                let cancel = cancel.clone();
                let section_id = section_id.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
                        match state.get_job_state::<SectionJob>(JOB_TYPE, &section_id).await {
                            Ok(Some(job)) if job.cancelled => {
                                cancel.cancel();
                                break;
                            }
                            Ok(Some(_)) => {}
                            _ => break,
                        }
                    }
                })
            };

            let run = pipeline.run_with_progress(&request, Some(&ptx), Some(&cancel));
            let outcome = tokio::select! {
                res = tokio::time::timeout(timeout, run) => Some(res),
                _ = cancel.cancelled() => None,
            };
            watcher.abort();

            // Drain pending pipeline events before any terminal event so the
            // terminal is always last on the consumer's stream.
            drop(ptx);
            let _ = forwarder.await;

            match outcome {
                None => {
                    let _ = tx.send(cancelled_event(&section_id)).await;
                    finish(&state, &section_id, &processing_id, JobStatus::Cancelled, None).await;
                }
                Some(Err(_elapsed)) => {
                    tracing::error!(section_id = %section_id, "section processing timed out");
                    let _ = tx
                        .send(Progress {
                            section_id: section_id.clone(),
                            stage: Stage::Error,
                            progress: 0,
                            message: "Processing timeout - section processing took too long"
                                .to_string(),
                            details: None,
                        })
                        .await;
                    finish(&state, &section_id, &processing_id, JobStatus::Failed, None).await;
                }
                Some(Ok(Ok(result))) => {
                    finish(
                        &state,
                        &section_id,
                        &processing_id,
                        JobStatus::Completed,
                        Some(result),
                    )
                    .await;
                }
                Some(Ok(Err(EngineError::Cancelled))) => {
                    let _ = tx.send(cancelled_event(&section_id)).await;
                    finish(&state, &section_id, &processing_id, JobStatus::Cancelled, None).await;
                }
                Some(Ok(Err(_))) => {
                    // The pipeline already emitted the error event.
                    finish(&state, &section_id, &processing_id, JobStatus::Failed, None).await;
                }
            }

            running.remove(&section_id);
        });

        Ok(rx)
    }

    /// Abort contract: tenant must match; a stale processing id is a stable
    /// no-op; otherwise the durable flag is set and any in-process task
    /// cancelled.
    pub async fn abort(
        &self,
        section_id: &str,
        processing_id: &str,
        tenant: &str,
    ) -> Result<AbortResult> {
        let Some(mut job) = self.job(section_id).await? else {
            return Ok(AbortResult {
                success: false,
                message: "No active processing found for section".to_string(),
            });
        };

        if job.tenant != tenant {
            tracing::warn!(section_id, tenant, "abort denied: tenant does not own session");
            return Err(EngineError::Auth("access denied".to_string()));
        }
        if job.processing_id != processing_id {
            return Ok(AbortResult {
                success: false,
                message: "Processing session no longer active".to_string(),
            });
        }

        job.cancelled = true;
        self.state.set_job_state(JOB_TYPE, section_id, &job).await?;

        if let Some(signal) = self.running.get(section_id) {
            signal.cancel();
            tracing::info!(section_id, "cancelled running section task");
        }

        Ok(AbortResult {
            success: true,
            message: "Section processing aborted".to_string(),
        })
    }
}

fn cancelled_event(section_id: &str) -> Progress {
    Progress {
        section_id: section_id.to_string(),
        stage: Stage::Cancelled,
        progress: 0,
        message: "Cancelled".to_string(),
        details: None,
    }
}

async fn finish(
    state: &StateManager,
    section_id: &str,
    processing_id: &str,
    status: JobStatus,
    result: Option<Outcome>,
) {
    // Only our own session writes the terminal state; a newer processing id
    // owns the record now.
    match state.get_job_state::<SectionJob>(JOB_TYPE, section_id).await {
        Ok(Some(mut job)) if job.processing_id == processing_id => {
            job.status = status;
            if status == JobStatus::Completed {
                job.progress = 100;
                job.message = "Complete".to_string();
            }
            if result.is_some() {
                job.result = result;
            }
            let _ = state.set_job_state(JOB_TYPE, section_id, &job).await;
        }
        _ => {
            tracing::info!(section_id, "skipping terminal state write, session superseded");
        }
    }
}
