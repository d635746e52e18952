//! Transactional volume switch-over: repointing volumes from one storage
//! provider handle to another, all-or-nothing.
//!
//! The copy pipeline moves bytes; this crate moves the *association*.
//! Nothing here touches object data, so a failed switch-over leaves both
//! sides intact and retryable.

mod file;
mod memory;

pub use file::FileVolumeStore;
pub use memory::MemoryVolumeStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub type Result<T> = std::result::Result<T, SwitchoverError>;

#[derive(Debug, thiserror::Error)]
pub enum SwitchoverError {
    #[error("switch-over config error: {0}")]
    Config(String),

    #[error("switch-over aborted at volume '{volume}': {reason}")]
    Transaction { volume: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A volume as the host system sees it: a named grouping of assets bound
/// to exactly one storage provider handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: i64,
    pub name: String,
    pub handle: String,
}

/// Which source handle maps to which target handle during switch-over.
/// Inverting the mapping yields the reverse switch, which is how a
/// migration is undone at the association level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub pairs: BTreeMap<String, String>,
}

impl VolumeMapping {
    pub fn new(pairs: BTreeMap<String, String>) -> Self {
        Self { pairs }
    }

    pub fn target_for(&self, source: &str) -> Option<&str> {
        self.pairs.get(source).map(String::as_str)
    }

    pub fn invert(&self) -> Self {
        Self {
            pairs: self
                .pairs
                .iter()
                .map(|(from, to)| (to.clone(), from.clone()))
                .collect(),
        }
    }
}

/// Answers whether a provider handle is configured. Switch-over refuses
/// to point a volume at a handle nobody can serve.
pub trait HandleResolver: Send + Sync {
    fn is_known(&self, handle: &str) -> bool;
}

impl HandleResolver for std::collections::BTreeSet<String> {
    fn is_known(&self, handle: &str) -> bool {
        self.contains(handle)
    }
}

impl HandleResolver for Vec<String> {
    fn is_known(&self, handle: &str) -> bool {
        self.iter().any(|h| h == handle)
    }
}

/// Where volumes live. `begin` opens a transaction whose mutations are
/// invisible until commit.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    async fn volumes(&self) -> Result<Vec<Volume>>;
    async fn begin(&self) -> Result<Box<dyn VolumeTransaction + '_>>;
}

#[async_trait]
pub trait VolumeTransaction: Send {
    async fn set_volume_handle(&mut self, volume_id: i64, handle: &str) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// One planned repointing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchAction {
    pub volume: Volume,
    pub from: String,
    pub to: String,
}

/// The outcome of planning: what would change and what stays put.
#[derive(Debug, Clone, Default)]
pub struct SwitchPlan {
    pub actions: Vec<SwitchAction>,
    /// Volumes whose current handle has no mapping entry.
    pub skipped: Vec<Volume>,
}

impl SwitchPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Plan a switch-over without touching anything. Every mapped target
/// must resolve to a configured handle or the whole plan is rejected;
/// volumes outside the mapping are skipped, not failed.
pub async fn preview(
    store: &dyn VolumeStore,
    mapping: &VolumeMapping,
    resolver: &dyn HandleResolver,
) -> Result<SwitchPlan> {
    for target in mapping.pairs.values() {
        if !resolver.is_known(target) {
            return Err(SwitchoverError::Config(format!(
                "mapping points at unknown provider handle '{target}'"
            )));
        }
    }

    let mut plan = SwitchPlan::default();
    for volume in store.volumes().await? {
        match mapping.target_for(&volume.handle) {
            Some(target) if target == volume.handle => plan.skipped.push(volume),
            Some(target) => {
                let to = target.to_string();
                let from = volume.handle.clone();
                plan.actions.push(SwitchAction { volume, from, to });
            }
            None => plan.skipped.push(volume),
        }
    }
    Ok(plan)
}

/// Execute a switch-over in a single transaction. Any failure rolls the
/// whole thing back; no volume is left pointing at the new handle unless
/// all of them are.
pub async fn switch(
    store: &dyn VolumeStore,
    mapping: &VolumeMapping,
    resolver: &dyn HandleResolver,
) -> Result<SwitchPlan> {
    let plan = preview(store, mapping, resolver).await?;
    if plan.is_empty() {
        info!("switch-over plan is empty; nothing to do");
        return Ok(plan);
    }

    let mut tx = store.begin().await?;
    let mut failure: Option<(String, String)> = None;
    for action in &plan.actions {
        info!(
            volume = %action.volume.name,
            from = %action.from,
            to = %action.to,
            "repointing volume"
        );
        if let Err(e) = tx.set_volume_handle(action.volume.id, &action.to).await {
            failure = Some((action.volume.name.clone(), e.to_string()));
            break;
        }
    }

    match failure {
        Some((volume, reason)) => {
            if let Err(e) = tx.rollback().await {
                warn!("rollback after failed switch-over also failed: {e}");
            }
            Err(SwitchoverError::Transaction { volume, reason })
        }
        None => {
            tx.commit().await?;
            info!(volumes = plan.actions.len(), "switch-over committed");
            Ok(plan)
        }
    }
}
