mod catalog;
mod changelog;
mod checkpoint;
mod engine;
mod lock;

pub use catalog::{AssetCatalog, AssetRecord, VolumeAssetCatalog};
pub use changelog::{ChangeLog, ChangeLogEntry, CopyOutcome};
pub use checkpoint::{CheckpointStatus, CheckpointStore, MigrationCheckpoint, Phase};
pub use engine::{
    CleanupReport, MigrateOptions, MigrationEngine, MigrationReport, RetryPolicy, RollbackReport,
};
pub use lock::{LockStore, MigrationLock};

use chrono::{DateTime, Utc};

pub type Result<T> = std::result::Result<T, MigrationError>;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("provider error: {0}")]
    Provider(#[from] provider::ProviderError),

    #[error("migration lock held for scope '{scope}' until {expires_at}")]
    LockConflict {
        scope: String,
        expires_at: DateTime<Utc>,
    },

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("invalid migration state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrationError {
    /// Scope-level failures abort the whole run; everything else is
    /// recovered per asset.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, MigrationError::Provider(e) if e.is_retryable() || e.is_not_found())
    }
}
