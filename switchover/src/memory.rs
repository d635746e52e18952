use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::{Result, SwitchoverError, Volume, VolumeStore, VolumeTransaction};

/// In-memory volume store. Backs tests and one-off tooling; the staged
/// transaction mirrors the file store's semantics.
pub struct MemoryVolumeStore {
    volumes: RwLock<Vec<Volume>>,
}

impl MemoryVolumeStore {
    pub fn new(volumes: Vec<Volume>) -> Self {
        Self {
            volumes: RwLock::new(volumes),
        }
    }
}

#[async_trait]
impl VolumeStore for MemoryVolumeStore {
    async fn volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.volumes.read().await.clone())
    }

    async fn begin(&self) -> Result<Box<dyn VolumeTransaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            store: self,
            staged: BTreeMap::new(),
        }))
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryVolumeStore,
    staged: BTreeMap<i64, String>,
}

#[async_trait]
impl VolumeTransaction for MemoryTransaction<'_> {
    async fn set_volume_handle(&mut self, volume_id: i64, handle: &str) -> Result<()> {
        let known = self
            .store
            .volumes
            .read()
            .await
            .iter()
            .any(|v| v.id == volume_id);
        if !known {
            return Err(SwitchoverError::Config(format!(
                "no volume with id {volume_id}"
            )));
        }
        self.staged.insert(volume_id, handle.to_string());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut volumes = self.store.volumes.write().await;
        for volume in volumes.iter_mut() {
            if let Some(handle) = self.staged.get(&volume.id) {
                volume.handle = handle.clone();
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // Staged changes were never visible; dropping them is enough.
        Ok(())
    }
}
