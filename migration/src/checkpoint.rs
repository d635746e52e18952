use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use crate::{MigrationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovering,
    Copying,
    Verifying,
    Done,
    Failed,
}

impl Phase {
    /// Terminal checkpoints are eligible for cleanup; non-terminal ones
    /// never are, regardless of age.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Discovering => "discovering",
            Phase::Copying => "copying",
            Phase::Verifying => "verifying",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The unit of resumable state. Persisted after every batch; the
/// persistence point is the resume boundary.
///
/// Invariant: `completed` and `failed` never overlap, and together with
/// the remaining assets they cover the whole discovered set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCheckpoint {
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// "source-handle->target-handle"; the unit the migration lock gates.
    pub scope: String,
    pub source_handle: String,
    pub target_handle: String,
    pub phase: Phase,
    pub total_assets: usize,
    /// Count of assets whose batch has been persisted, kept for status
    /// display. Resume does not seek to it: every run re-enumerates from
    /// the start and re-validates completed assets via the cheap
    /// skip-on-match check, which also catches target-side drift.
    pub cursor: usize,
    pub completed: BTreeSet<String>,
    pub failed: BTreeMap<String, String>,
}

impl MigrationCheckpoint {
    pub fn new(source_handle: &str, target_handle: &str) -> Self {
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            checkpoint_id: format!("mig-{}-{}", now.format("%Y%m%d%H%M%S"), &suffix[..8]),
            created_at: now,
            updated_at: now,
            scope: format!("{source_handle}->{target_handle}"),
            source_handle: source_handle.to_string(),
            target_handle: target_handle.to_string(),
            phase: Phase::Discovering,
            total_assets: 0,
            cursor: 0,
            completed: BTreeSet::new(),
            failed: BTreeMap::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.total_assets
            .saturating_sub(self.completed.len() + self.failed.len())
    }

    pub fn mark_completed(&mut self, asset_id: &str) {
        self.failed.remove(asset_id);
        self.completed.insert(asset_id.to_string());
    }

    pub fn mark_failed(&mut self, asset_id: &str, error: String) {
        self.completed.remove(asset_id);
        self.failed.insert(asset_id.to_string(), error);
    }

    /// Verification found the asset missing or mismatched at target.
    pub fn demote(&mut self, asset_id: &str, error: String) {
        self.mark_failed(asset_id, error);
    }

    pub fn status(&self) -> CheckpointStatus {
        CheckpointStatus {
            checkpoint_id: self.checkpoint_id.clone(),
            scope: self.scope.clone(),
            phase: self.phase,
            total_assets: self.total_assets,
            completed: self.completed.len(),
            failed: self.failed.len(),
            cursor: self.cursor,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Compact summary persisted next to the full record so `status` queries
/// never materialize the completed set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointStatus {
    pub checkpoint_id: String,
    pub scope: String,
    pub phase: Phase,
    pub total_assets: usize,
    pub completed: usize,
    pub failed: usize,
    pub cursor: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// File-backed checkpoint store: one JSON record plus a status sidecar
/// per checkpoint id, written atomically via temp + rename.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn status_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.status.json"))
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Persist the checkpoint and its status sidecar. Single writer per
    /// checkpoint id; writes are strictly ordered by the batch loop.
    pub async fn save(&self, checkpoint: &mut MigrationCheckpoint) -> Result<()> {
        checkpoint.updated_at = Utc::now();
        let state = serde_json::to_vec_pretty(checkpoint)?;
        self.write_atomic(&self.state_path(&checkpoint.checkpoint_id), &state)
            .await?;
        let status = serde_json::to_vec_pretty(&checkpoint.status())?;
        self.write_atomic(&self.status_path(&checkpoint.checkpoint_id), &status)
            .await?;
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<MigrationCheckpoint> {
        match fs::read(self.state_path(id)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MigrationError::CheckpointNotFound(id.to_string()))
            }
            Err(e) => Err(MigrationError::Io(e)),
        }
    }

    /// Reads only the status sidecar.
    pub async fn status(&self, id: &str) -> Result<CheckpointStatus> {
        match fs::read(self.status_path(id)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MigrationError::CheckpointNotFound(id.to_string()))
            }
            Err(e) => Err(MigrationError::Io(e)),
        }
    }

    pub async fn list(&self) -> Result<Vec<CheckpointStatus>> {
        let mut statuses = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".status.json") {
                match self.status(id).await {
                    Ok(status) => statuses.push(status),
                    Err(e) => tracing::warn!(id, "unreadable checkpoint status: {e}"),
                }
            }
        }
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(statuses)
    }

    /// Most recently updated checkpoint for a scope, if any.
    pub async fn load_latest(&self, scope: &str) -> Result<Option<MigrationCheckpoint>> {
        let mut candidates: Vec<CheckpointStatus> = self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.scope == scope)
            .collect();
        candidates.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        match candidates.pop() {
            Some(status) => Ok(Some(self.load(&status.checkpoint_id).await?)),
            None => Ok(None),
        }
    }

    /// Remove the checkpoint record, its sidecar, and its change log.
    pub async fn purge(&self, id: &str) -> Result<()> {
        for path in [
            self.state_path(id),
            self.status_path(id),
            self.dir.join(format!("{id}.changelog.jsonl")),
        ] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(MigrationError::Io(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        let mut checkpoint = MigrationCheckpoint::new("do_images", "aws_images");
        checkpoint.total_assets = 3;
        checkpoint.mark_completed("a");
        checkpoint.mark_failed("b", "timeout".to_string());
        store.save(&mut checkpoint).await.unwrap();

        let loaded = store.load(&checkpoint.checkpoint_id).await.unwrap();
        assert_eq!(loaded.scope, "do_images->aws_images");
        assert_eq!(loaded.completed.len(), 1);
        assert_eq!(loaded.failed.get("b").unwrap(), "timeout");
        assert_eq!(loaded.remaining(), 1);
    }

    #[tokio::test]
    async fn status_reads_only_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        let mut checkpoint = MigrationCheckpoint::new("src", "dst");
        checkpoint.total_assets = 10;
        checkpoint.mark_completed("x");
        store.save(&mut checkpoint).await.unwrap();

        // Corrupt the full record; status must still be readable.
        std::fs::write(
            store.state_path(&checkpoint.checkpoint_id),
            b"not valid json",
        )
        .unwrap();
        let status = store.status(&checkpoint.checkpoint_id).await.unwrap();
        assert_eq!(status.completed, 1);
        assert_eq!(status.total_assets, 10);
    }

    #[tokio::test]
    async fn completed_and_failed_never_overlap() {
        let mut checkpoint = MigrationCheckpoint::new("src", "dst");
        checkpoint.mark_failed("a", "boom".to_string());
        checkpoint.mark_completed("a");
        assert!(checkpoint.completed.contains("a"));
        assert!(!checkpoint.failed.contains_key("a"));

        checkpoint.demote("a", "size mismatch".to_string());
        assert!(!checkpoint.completed.contains("a"));
        assert!(checkpoint.failed.contains_key("a"));
    }

    #[tokio::test]
    async fn load_latest_picks_most_recent_for_scope() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        let mut first = MigrationCheckpoint::new("src", "dst");
        store.save(&mut first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut second = MigrationCheckpoint::new("src", "dst");
        store.save(&mut second).await.unwrap();
        let mut other_scope = MigrationCheckpoint::new("src", "elsewhere");
        store.save(&mut other_scope).await.unwrap();

        let latest = store.load_latest("src->dst").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, second.checkpoint_id);
        assert!(store.load_latest("nope->nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_removes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        let mut checkpoint = MigrationCheckpoint::new("src", "dst");
        store.save(&mut checkpoint).await.unwrap();
        store.purge(&checkpoint.checkpoint_id).await.unwrap();
        assert!(matches!(
            store.load(&checkpoint.checkpoint_id).await,
            Err(MigrationError::CheckpointNotFound(_))
        ));
        // Idempotent.
        store.purge(&checkpoint.checkpoint_id).await.unwrap();
    }
}
