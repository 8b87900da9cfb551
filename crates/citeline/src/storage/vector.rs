//! Vector store contract and the indexing client built on it.
//!
//! The store itself is an external collaborator: a primary-keyed document
//! store with an embedded vector index. `VectorStore` captures exactly the
//! operations the engine needs; `MemoryVectorStore` is the in-process
//! reference implementation used by tests and local runs. `VectorIndex`
//! layers the engine's semantics on top: batched upsert with the
//! duplicate-key fallback, validated search, tenant-scoped delete.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::embeddings::EmbeddingClient;
use crate::error::{EngineError, Result};
use crate::rag::similarity::cosine;
use crate::types::{Chunk, File, Match, Meta, Slice, Unit};

/// One stored document: a chunk, its embedding, and denormalized metadata
/// the search projection returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDoc {
    pub id: String,
    pub embedding: Vec<f32>,
    pub units: Vec<Unit>,
    pub tokens: usize,
    pub file_id: String,
    pub file_name: String,
    pub chunk_index: usize,
    pub namespace: String,
    pub company: Option<String>,
    pub ticker: Option<String>,
    pub doc_type: Option<String>,
    pub period_label: Option<String>,
    pub blurb: Option<String>,
    pub sheet: Option<String>,
    pub truncated: Option<bool>,
}

impl VectorDoc {
    fn meta_field(&self, key: &str) -> Option<&str> {
        match key {
            "company" => self.company.as_deref(),
            "ticker" => self.ticker.as_deref(),
            "doc_type" => self.doc_type.as_deref(),
            "period_label" => self.period_label.as_deref(),
            "namespace" => Some(&self.namespace),
            _ => None,
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert documents, failing with a duplicate-key storage error when any
    /// primary key already exists.
    async fn insert_many(&self, docs: &[VectorDoc]) -> Result<()>;

    /// Replace a document by primary key, inserting when absent.
    async fn replace_one(&self, doc: &VectorDoc) -> Result<()>;

    /// Nearest-neighbor query restricted to `file_ids`, optionally filtered
    /// by metadata fields. Returns `(doc, score)` in descending score order.
    async fn query(
        &self,
        vector: &[f32],
        file_ids: &[String],
        top_k: usize,
        filters: Option<&HashMap<String, String>>,
    ) -> Result<Vec<(VectorDoc, f32)>>;

    /// Delete every chunk of `file_id` within `namespace`. Returns the count.
    async fn delete_by_file(&self, file_id: &str, namespace: &str) -> Result<usize>;
}

/// In-memory reference implementation with primary-key semantics and
/// brute-force cosine scoring.
#[derive(Default)]
pub struct MemoryVectorStore {
    docs: DashMap<String, VectorDoc>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn insert_many(&self, docs: &[VectorDoc]) -> Result<()> {
        if let Some(existing) = docs.iter().find(|d| self.docs.contains_key(&d.id)) {
            return Err(EngineError::Storage(format!(
                "duplicate key: {}",
                existing.id
            )));
        }
        for doc in docs {
            self.docs.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn replace_one(&self, doc: &VectorDoc) -> Result<()> {
        self.docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        file_ids: &[String],
        top_k: usize,
        filters: Option<&HashMap<String, String>>,
    ) -> Result<Vec<(VectorDoc, f32)>> {
        let mut scored: Vec<(VectorDoc, f32)> = self
            .docs
            .iter()
            .filter(|entry| file_ids.iter().any(|id| id == &entry.file_id))
            .filter(|entry| match filters {
                Some(filters) => filters
                    .iter()
                    .all(|(k, v)| entry.meta_field(k) == Some(v.as_str())),
                None => true,
            })
            .map(|entry| {
                let score = cosine(vector, &entry.embedding);
                (entry.value().clone(), score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete_by_file(&self, file_id: &str, namespace: &str) -> Result<usize> {
        let ids: Vec<String> = self
            .docs
            .iter()
            .filter(|entry| entry.file_id == file_id && entry.namespace == namespace)
            .map(|entry| entry.id.clone())
            .collect();
        for id in &ids {
            self.docs.remove(id);
        }
        Ok(ids.len())
    }
}

fn is_duplicate_key(err: &EngineError) -> bool {
    err.to_string().to_lowercase().contains("duplicate")
}

/// Indexing client: embeds chunk text and maintains the stored documents.
pub struct VectorIndex {
    store: Arc<dyn VectorStore>,
    embedder: Arc<EmbeddingClient>,
    batch_size: usize,
    rate_limit_delay: std::time::Duration,
}

impl VectorIndex {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<EmbeddingClient>, config: &Config) -> Self {
        Self {
            store,
            embedder,
            batch_size: config.index.batch_size,
            rate_limit_delay: config.index.rate_limit_delay,
        }
    }

    fn document_for(chunk: &Chunk, chunk_index: usize, namespace: &str, meta: &Meta, embedding: Vec<f32>) -> VectorDoc {
        VectorDoc {
            id: format!("{}_{}", chunk.file.id, chunk_index),
            embedding,
            units: chunk.units.clone(),
            tokens: chunk.tokens,
            file_id: chunk.file.id.clone(),
            file_name: chunk.file.name.clone(),
            chunk_index,
            namespace: namespace.to_string(),
            company: meta.company.clone(),
            ticker: meta.ticker.clone(),
            doc_type: meta.doc_type.clone(),
            period_label: meta.period_label.clone(),
            blurb: meta.blurb.clone(),
            sheet: chunk.slice.as_ref().map(|s| s.sheet.clone()),
            truncated: chunk.slice.as_ref().map(|s| s.truncated),
        }
    }

    /// Embed and upsert chunks in batches. The primary key is
    /// `<file_id>_<chunk_index>`; a duplicate-key failure falls back to
    /// per-document replace so re-ingesting a file converges.
    pub async fn upsert_chunks(&self, chunks: &[Chunk], namespace: &str, meta: &Meta) -> Result<usize> {
        let mut total = 0usize;

        for (batch_no, batch) in chunks.chunks(self.batch_size).enumerate() {
            if batch_no > 0 {
                tokio::time::sleep(self.rate_limit_delay).await;
            }

            let texts: Vec<String> = batch
                .iter()
                .map(|chunk| {
                    chunk
                        .units
                        .iter()
                        .map(|u| u.text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .collect();
            let embeddings = self.embedder.embed_many(&texts).await?;

            let docs: Vec<VectorDoc> = batch
                .iter()
                .zip(embeddings)
                .enumerate()
                .map(|(j, (chunk, embedding))| {
                    Self::document_for(chunk, batch_no * self.batch_size + j, namespace, meta, embedding)
                })
                .collect();

            match self.store.insert_many(&docs).await {
                Ok(()) => {}
                Err(err) if is_duplicate_key(&err) => {
                    for doc in &docs {
                        self.store.replace_one(doc).await?;
                    }
                }
                Err(err) => return Err(err),
            }

            total += docs.len();
        }

        tracing::info!(vectors = total, "batch upsert completed");
        Ok(total)
    }

    /// Vector search scoped to `file_ids`, ordered by descending similarity.
    pub async fn search(
        &self,
        query: &str,
        file_ids: &[String],
        top_k: usize,
        filters: Option<&HashMap<String, String>>,
    ) -> Result<Vec<Match>> {
        if query.trim().is_empty() || file_ids.is_empty() {
            return Err(EngineError::Validation(
                "query and file_ids are required".to_string(),
            ));
        }
        if top_k == 0 || top_k > 100 {
            return Err(EngineError::Validation(
                "top_k must be between 1 and 100".to_string(),
            ));
        }

        let vector = self.embedder.embed_one(query).await?;
        let scored = self
            .store
            .query(&vector, file_ids, top_k, filters)
            .await
            .map_err(|e| EngineError::Retrieval(format!("search operation failed: {e}")))?;

        Ok(scored
            .into_iter()
            .map(|(doc, score)| Match {
                id: doc.id,
                score: score.clamp(0.0, 1.0),
                file: File {
                    id: doc.file_id,
                    name: doc.file_name,
                },
                units: doc.units,
                tokens: doc.tokens,
                slice: doc.sheet.map(|sheet| Slice {
                    sheet,
                    truncated: doc.truncated.unwrap_or(false),
                }),
                meta: Meta {
                    company: doc.company,
                    ticker: doc.ticker,
                    doc_type: doc.doc_type,
                    period_label: doc.period_label,
                    blurb: doc.blurb,
                },
            })
            .collect())
    }

    /// Tenant-scoped delete of every chunk belonging to a file.
    pub async fn delete_file(&self, file_id: &str, namespace: &str) -> Result<usize> {
        if file_id.is_empty() || namespace.is_empty() {
            return Err(EngineError::Validation(
                "file_id and namespace are required".to_string(),
            ));
        }
        let deleted = self
            .store
            .delete_by_file(file_id, namespace)
            .await
            .map_err(|e| EngineError::Retrieval(format!("delete operation failed: {e}")))?;
        tracing::info!(file_id, deleted, "deleted file chunks");
        Ok(deleted)
    }
}
