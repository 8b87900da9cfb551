//! Relational file-store adapter.
//!
//! The metadata store lives outside the engine; this is the narrow surface
//! the pipeline reads and writes through. `files.content` holds the
//! `unit_id → Unit` map for citation resolution and `files.metadata.sheets`
//! the full sheets for truncated-table recovery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::types::{Meta, Sheet, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// One row of the files table, as the engine sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub file_name: String,
    /// Blob key of the original upload.
    pub file_path: String,
    pub file_size: u64,
    pub status: ProcessingStatus,
    pub meta: Meta,
    /// Blob key of the display artifact (derived PDF for office uploads).
    pub display_path: Option<String>,
    pub content: HashMap<String, Unit>,
    pub sheets: HashMap<String, Sheet>,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(id: impl Into<String>, file_name: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            file_path: file_path.into(),
            file_size: 0,
            status: ProcessingStatus::Pending,
            meta: Meta::default(),
            display_path: None,
            content: HashMap::new(),
            sheets: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn get(&self, file_id: &str) -> Result<Option<FileRecord>>;

    async fn insert(&self, record: FileRecord) -> Result<()>;

    /// Persist the parse artifacts: inferred metadata, the content map, and
    /// (for table documents) the full sheets.
    async fn save_results(
        &self,
        file_id: &str,
        meta: &Meta,
        display_path: Option<&str>,
        content: &HashMap<String, Unit>,
        sheets: Option<&HashMap<String, Sheet>>,
    ) -> Result<()>;

    async fn set_status(&self, file_id: &str, status: ProcessingStatus) -> Result<()>;

    /// Full sheets for a file, for truncated-table recovery. Empty map when
    /// the file has none.
    async fn sheets(&self, file_id: &str) -> Result<HashMap<String, Sheet>>;
}

#[derive(Default)]
pub struct MemoryFileStore {
    records: DashMap<String, FileRecord>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn get(&self, file_id: &str) -> Result<Option<FileRecord>> {
        Ok(self.records.get(file_id).map(|r| r.clone()))
    }

    async fn insert(&self, record: FileRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn save_results(
        &self,
        file_id: &str,
        meta: &Meta,
        display_path: Option<&str>,
        content: &HashMap<String, Unit>,
        sheets: Option<&HashMap<String, Sheet>>,
    ) -> Result<()> {
        let mut record = self
            .records
            .get_mut(file_id)
            .ok_or_else(|| EngineError::Storage(format!("file {file_id} not found")))?;
        record.meta = meta.clone();
        record.display_path = display_path.map(str::to_string);
        record.content = content.clone();
        if let Some(sheets) = sheets {
            record.sheets = sheets.clone();
        }
        Ok(())
    }

    async fn set_status(&self, file_id: &str, status: ProcessingStatus) -> Result<()> {
        let mut record = self
            .records
            .get_mut(file_id)
            .ok_or_else(|| EngineError::Storage(format!("file {file_id} not found")))?;
        record.status = status;
        Ok(())
    }

    async fn sheets(&self, file_id: &str) -> Result<HashMap<String, Sheet>> {
        Ok(self
            .records
            .get(file_id)
            .map(|r| r.sheets.clone())
            .unwrap_or_default())
    }
}
