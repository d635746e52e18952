use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{MigrationError, Result};

/// Mutual-exclusion record for one checkpoint scope. A crashed process
/// leaves its lock behind; expiry makes it reclaimable instead of a
/// permanent deadlock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationLock {
    pub scope: String,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MigrationLock {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// File-backed lock store, one file per scope under the state directory.
pub struct LockStore {
    dir: PathBuf,
    ttl: Duration,
}

impl LockStore {
    pub async fn open<P: AsRef<Path>>(dir: P, ttl: std::time::Duration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(1)),
        })
    }

    fn path(&self, scope: &str) -> PathBuf {
        let safe: String = scope
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("lock-{safe}.json"))
    }

    pub async fn current(&self, scope: &str) -> Result<Option<MigrationLock>> {
        match fs::read(self.path(scope)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MigrationError::Io(e)),
        }
    }

    /// Refuses while a live lock exists for the scope. An expired lock is
    /// reclaimed in place.
    pub async fn acquire(&self, scope: &str) -> Result<MigrationLock> {
        if let Some(existing) = self.current(scope).await? {
            if !existing.is_expired() {
                return Err(MigrationError::LockConflict {
                    scope: scope.to_string(),
                    expires_at: existing.expires_at,
                });
            }
            warn!(scope, token = %existing.token, "reclaiming expired migration lock");
        }
        let now = Utc::now();
        let lock = MigrationLock {
            scope: scope.to_string(),
            token: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + self.ttl,
        };
        fs::write(self.path(scope), serde_json::to_vec_pretty(&lock)?).await?;
        info!(scope, token = %lock.token, "acquired migration lock");
        Ok(lock)
    }

    /// Releases only if the lock on disk still carries our token.
    pub async fn release(&self, lock: &MigrationLock) -> Result<()> {
        match self.current(&lock.scope).await? {
            Some(existing) if existing.token == lock.token => {
                fs::remove_file(self.path(&lock.scope)).await?;
                Ok(())
            }
            Some(existing) => {
                warn!(
                    scope = %lock.scope,
                    ours = %lock.token,
                    theirs = %existing.token,
                    "not releasing lock held by another run"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Operator override: clear every lock regardless of age or owner.
    pub async fn force_clear(&self) -> Result<usize> {
        let mut cleared = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("lock-") && name.ends_with(".json") {
                fs::remove_file(entry.path()).await?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}
