use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use provider::{ListOptions, StorageProvider};

use crate::Result;

/// One asset the host system knows about: a stable identifier and the
/// logical path of its physical file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: String,
    pub path: String,
    pub size: Option<u64>,
}

/// Seam to the host metadata store. The engine only needs a stable,
/// deterministically ordered enumeration and an optional hook to record
/// the new association after a successful copy.
#[async_trait]
pub trait AssetCatalog: Send + Sync {
    /// Assets governed by the source provider, sorted by id so that a
    /// cursor position is meaningful across runs.
    async fn discover(&self, filter: Option<&str>) -> Result<Vec<AssetRecord>>;

    /// Called once per asset after it lands at target. Default is a
    /// no-op for hosts that key metadata off the volume, not the file.
    async fn mark_migrated(&self, _asset_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Catalog backed by the source provider itself: every object under the
/// configured volume prefixes is an asset, identified by its path.
pub struct VolumeAssetCatalog {
    source: Arc<dyn StorageProvider>,
    prefixes: Vec<String>,
}

impl VolumeAssetCatalog {
    pub fn new(source: Arc<dyn StorageProvider>, prefixes: Vec<String>) -> Self {
        let prefixes = if prefixes.is_empty() {
            vec![String::new()]
        } else {
            prefixes
        };
        Self { source, prefixes }
    }
}

#[async_trait]
impl AssetCatalog for VolumeAssetCatalog {
    async fn discover(&self, filter: Option<&str>) -> Result<Vec<AssetRecord>> {
        let mut records = Vec::new();
        for prefix in &self.prefixes {
            let objects = self
                .source
                .as_ref()
                .list_all(prefix, ListOptions::default())
                .await?;
            for object in objects {
                if let Some(needle) = filter {
                    if !object.path.contains(needle) {
                        continue;
                    }
                }
                records.push(AssetRecord {
                    id: object.path.clone(),
                    path: object.path,
                    size: Some(object.size),
                });
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records.dedup_by(|a, b| a.id == b.id);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use provider::MemoryProvider;

    #[tokio::test]
    async fn discovery_is_sorted_and_deduplicated() {
        let source = Arc::new(MemoryProvider::new("src"));
        source.put("images/z.jpg".to_string(), Bytes::new()).await;
        source.put("images/a.jpg".to_string(), Bytes::new()).await;
        source.put("docs/m.pdf".to_string(), Bytes::new()).await;

        // Overlapping prefixes must not duplicate records.
        let catalog = VolumeAssetCatalog::new(
            source,
            vec!["images/".to_string(), "".to_string(), "docs/".to_string()],
        );
        let records = catalog.discover(None).await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["docs/m.pdf", "images/a.jpg", "images/z.jpg"]);
    }

    #[tokio::test]
    async fn filter_narrows_discovery() {
        let source = Arc::new(MemoryProvider::new("src"));
        source.put("images/a.jpg".to_string(), Bytes::new()).await;
        source.put("docs/b.pdf".to_string(), Bytes::new()).await;

        let catalog = VolumeAssetCatalog::new(source, vec![]);
        let records = catalog.discover(Some("images/")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "images/a.jpg");
    }
}
