//! Health record stores.
//!
//! Two implementations: a JSON-lines file (one record per line, purge
//! rewrites through a temporary file and an atomic rename) and a bounded
//! in-memory ring.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pvh_core::HealthRecord;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn append(&self, record: &HealthRecord) -> Result<(), StoreError>;

    /// Removes records older than `cutoff`. Returns how many were removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Up to `limit` most recent records, oldest first.
    async fn recent(&self, limit: usize) -> Result<Vec<HealthRecord>, StoreError>;
}

// ============================================================================
// JSON-lines file store
// ============================================================================

pub struct JsonlStore {
    path: PathBuf,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<HealthRecord>, StoreError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let mut records = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HealthRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping unreadable health record"
                ),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl RecordStore for JsonlStore {
    async fn append(&self, record: &HealthRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(&self.path, e))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let records = self.read_all().await?;
        let before = records.len();
        let kept: Vec<&HealthRecord> = records.iter().filter(|r| r.timestamp >= cutoff).collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut text = String::new();
        for record in kept {
            text.push_str(&serde_json::to_string(record)?);
            text.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        debug!(removed, path = %self.path.display(), "Purged expired health records");
        Ok(removed)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HealthRecord>, StoreError> {
        let mut records = self.read_all().await?;
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }
}

// ============================================================================
// In-memory store
// ============================================================================

pub struct MemoryStore {
    records: Mutex<VecDeque<HealthRecord>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn append(&self, record: &HealthRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        records.push_back(record.clone());
        while records.len() > self.capacity {
            records.pop_front();
        }
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        Ok(before - records.len())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HealthRecord>, StoreError> {
        let records = self.records.lock().await;
        let skip = records.len().saturating_sub(limit);
        Ok(records.iter().skip(skip).cloned().collect())
    }
}
