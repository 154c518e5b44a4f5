//! Best-effort storage of finished sessions.

use crate::error::ArenaError;
use crate::models::{FailedModel, RankedResult, SessionReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// What gets written for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub evaluations: Vec<RankedResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailedModel>,
    pub total_cost: f64,
}

impl PersistedSession {
    pub fn from_report(report: &SessionReport, created_at: DateTime<Utc>) -> Self {
        Self {
            prompt: report.prompt.clone(),
            created_at,
            evaluations: report.evaluations().to_vec(),
            failures: report.failures(),
            total_cost: report.total_cost,
        }
    }
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Store a report, returning where it went
    async fn persist(&self, report: &SessionReport) -> Result<PathBuf, ArenaError>;
}

/// Writes each session as pretty JSON into a directory
#[derive(Debug, Clone)]
pub struct FileResultSink {
    dir: PathBuf,
}

impl FileResultSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for a session stored at `at`
    pub fn file_name(at: DateTime<Utc>) -> String {
        format!("arena-{}.json", at.format("%Y%m%dT%H%M%S%.3fZ"))
    }

    async fn ensure_directory_exists(&self) -> Result<(), ArenaError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            ArenaError::Persistence(format!(
                "Failed to create directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl ResultSink for FileResultSink {
    async fn persist(&self, report: &SessionReport) -> Result<PathBuf, ArenaError> {
        let created_at = Utc::now();
        let session = PersistedSession::from_report(report, created_at);
        let json_content = serde_json::to_string_pretty(&session)
            .map_err(|e| ArenaError::Persistence(format!("Failed to serialize session: {}", e)))?;

        self.ensure_directory_exists().await?;
        let path = self.dir.join(Self::file_name(created_at));
        tokio::fs::write(&path, json_content).await.map_err(|e| {
            ArenaError::Persistence(format!("Failed to write {}: {}", path.display(), e))
        })?;

        debug!(path = %path.display(), "session written");
        Ok(path)
    }
}
