//! Execution Persistence
//!
//! Terminal results are saved as [`ExecutionRecord`]s so that callers of
//! asynchronous executions can observe the outcome later.
//!
//! [`JsonFileStore`] writes one file per execution to
//! `{store_dir}/executions/{execution_id}.json`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::{ErrorInfo, ExecutionContext, ExecutionMetrics, ExecutionResult, ExecutionStatus, Priority};
use crate::error::Result;

/// Persisted view of one execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: String,
    pub definition_id: String,
    pub caller_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub priority: Priority,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub metrics: ExecutionMetrics,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn new(context: &ExecutionContext, result: &ExecutionResult) -> Self {
        Self {
            id: result.execution_id.clone(),
            definition_id: result.definition_id.clone(),
            caller_id: context.caller_id().to_string(),
            tenant_id: context.tenant_id().map(str::to_string),
            priority: context.priority(),
            status: result.status,
            input: context.input().clone(),
            output: result.output.clone(),
            error: result.error.clone(),
            metrics: result.metrics.clone(),
            started_at: result.started_at,
            completed_at: result.completed_at,
        }
    }
}

/// Destination for execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Saves a record, replacing any earlier record with the same id.
    async fn save(&self, record: &ExecutionRecord) -> Result<()>;

    /// Loads a record by execution id.
    async fn load(&self, id: &str) -> Result<Option<ExecutionRecord>>;
}

/// Process-local store.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, ExecutionRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn save(&self, record: &ExecutionRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }
}

/// Store writing pretty-printed JSON files.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Records are written under `{store_dir}/executions`.
    pub fn new(store_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: store_dir.as_ref().join("executions"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl ExecutionStore for JsonFileStore {
    async fn save(&self, record: &ExecutionRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;

        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!("Saved execution record to {}", path.display());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let path = self.record_path(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No execution record at {}", path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
