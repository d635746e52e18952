use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::{Result, SwitchoverError, Volume, VolumeStore, VolumeTransaction};

/// Volume store persisted as a single JSON document. The transaction
/// mutates an in-memory snapshot and replaces the file atomically on
/// commit, so readers never observe a half-applied switch-over.
pub struct FileVolumeStore {
    path: PathBuf,
}

impl FileVolumeStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Seed the store, creating parent directories as needed.
    pub async fn create<P: AsRef<Path>>(path: P, volumes: &[Volume]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let store = Self { path };
        store.write_atomic(volumes).await?;
        Ok(store)
    }

    async fn load(&self) -> Result<Vec<Volume>> {
        match fs::read(&self.path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(SwitchoverError::Io(e)),
        }
    }

    async fn write_atomic(&self, volumes: &[Volume]) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(volumes)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl VolumeStore for FileVolumeStore {
    async fn volumes(&self) -> Result<Vec<Volume>> {
        self.load().await
    }

    async fn begin(&self) -> Result<Box<dyn VolumeTransaction + '_>> {
        let snapshot = self.load().await?;
        Ok(Box::new(FileTransaction {
            store: self,
            snapshot,
        }))
    }
}

struct FileTransaction<'a> {
    store: &'a FileVolumeStore,
    snapshot: Vec<Volume>,
}

#[async_trait]
impl VolumeTransaction for FileTransaction<'_> {
    async fn set_volume_handle(&mut self, volume_id: i64, handle: &str) -> Result<()> {
        match self.snapshot.iter_mut().find(|v| v.id == volume_id) {
            Some(volume) => {
                volume.handle = handle.to_string();
                Ok(())
            }
            None => Err(SwitchoverError::Config(format!(
                "no volume with id {volume_id}"
            ))),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.store.write_atomic(&self.snapshot).await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // The file was never touched; discard the snapshot.
        Ok(())
    }
}
