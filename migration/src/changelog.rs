use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyOutcome {
    Copied,
    SkippedAlreadyPresent,
    Failed,
}

/// One reversible record per migrated object. Rollback replays these in
/// reverse; only `Copied` entries are undone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub asset_id: String,
    pub source_path: String,
    pub target_path: String,
    pub source_handle: String,
    pub target_handle: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
    pub outcome: CopyOutcome,
    pub error: Option<String>,
}

impl ChangeLogEntry {
    pub fn new(
        asset_id: &str,
        path: &str,
        source_handle: &str,
        target_handle: &str,
        size: u64,
        outcome: CopyOutcome,
    ) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            source_path: path.to_string(),
            target_path: path.to_string(),
            source_handle: source_handle.to_string(),
            target_handle: target_handle.to_string(),
            size,
            timestamp: Utc::now(),
            outcome,
            error: None,
        }
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Append-only JSONL ledger, one file per checkpoint.
pub struct ChangeLog {
    path: PathBuf,
}

impl ChangeLog {
    pub fn for_checkpoint(dir: &Path, checkpoint_id: &str) -> Self {
        Self {
            path: dir.join(format!("{checkpoint_id}.changelog.jsonl")),
        }
    }

    pub async fn append(&self, entry: &ChangeLogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// All entries in append order. Missing file reads as empty.
    pub async fn entries(&self) -> Result<Vec<ChangeLogEntry>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }
}
