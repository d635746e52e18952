use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::any::Any;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::interface::{ListPage, StorageProvider};
use crate::object::{guess_content_type, ListOptions, StorageObject, WriteOptions};
use crate::{ProviderCapabilities, ProviderError, Result};

struct StoredObject {
    data: Bytes,
    meta: StorageObject,
}

/// In-memory provider. Fixture backend for tests and dry-run rehearsals;
/// registered under the `memory` type tag.
pub struct MemoryProvider {
    handle: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    capabilities: ProviderCapabilities,
}

impl MemoryProvider {
    pub fn new(handle: impl Into<String>) -> Self {
        Self::with_batch_size(handle, 10)
    }

    pub fn with_batch_size(handle: impl Into<String>, optimal_batch_size: usize) -> Self {
        Self {
            handle: handle.into(),
            objects: RwLock::new(BTreeMap::new()),
            capabilities: ProviderCapabilities {
                supports_server_side_copy: false,
                supports_versioning: false,
                supports_streaming: true,
                max_file_size: None,
                optimal_batch_size,
            },
        }
    }

    /// Seed an object directly, bypassing the trait.
    pub async fn put(&self, path: String, data: Bytes) {
        let meta = StorageObject {
            path: path.clone(),
            size: data.len() as u64,
            content_type: guess_content_type(&path).to_string(),
            last_modified: Utc::now(),
            version_id: None,
        };
        self.objects
            .write()
            .await
            .insert(path, StoredObject { data, meta });
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn paths(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn object_exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(path))
    }

    async fn metadata(&self, path: &str) -> Result<StorageObject> {
        self.objects
            .read()
            .await
            .get(path)
            .map(|o| o.meta.clone())
            .ok_or_else(|| ProviderError::NotFound(path.to_string()))
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| ProviderError::NotFound(path.to_string()))
    }

    async fn read_stream(&self, path: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let data = self.read(path).await?;
        Ok(stream::once(async move { Ok(data) }).boxed())
    }

    async fn write(&self, path: &str, data: Bytes, options: WriteOptions) -> Result<()> {
        let meta = StorageObject {
            path: path.to_string(),
            size: data.len() as u64,
            content_type: options
                .content_type
                .unwrap_or_else(|| guess_content_type(path).to_string()),
            last_modified: Utc::now(),
            version_id: None,
        };
        self.objects
            .write()
            .await
            .insert(path.to_string(), StoredObject { data, meta });
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().await.remove(path);
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        options: &ListOptions,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let objects = self.objects.read().await;
        let mut page = Vec::with_capacity(options.max_keys.min(1000));
        let mut last = None;
        for (path, stored) in objects.range(prefix.to_string()..) {
            if !path.starts_with(prefix) {
                break;
            }
            if let Some(token) = &continuation {
                if path.as_str() <= token.as_str() {
                    continue;
                }
            }
            if !options.recursive && path[prefix.len()..].contains('/') {
                continue;
            }
            if page.len() >= options.max_keys.max(1) {
                // More remain past this page.
                return Ok(ListPage {
                    objects: page,
                    continuation: last,
                });
            }
            page.push(stored.meta.clone());
            last = Some(path.clone());
        }
        Ok(ListPage {
            objects: page,
            continuation: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existence_is_a_value_not_an_error() {
        let provider = MemoryProvider::new("mem");
        assert!(!provider.object_exists("missing.txt").await.unwrap());
        let err = provider.metadata("missing.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn write_overwrites_fully() {
        let provider = MemoryProvider::new("mem");
        provider
            .write("a.txt", Bytes::from_static(b"one"), WriteOptions::default())
            .await
            .unwrap();
        provider
            .write(
                "a.txt",
                Bytes::from_static(b"two-longer"),
                WriteOptions::content_type("text/plain"),
            )
            .await
            .unwrap();
        let meta = provider.metadata("a.txt").await.unwrap();
        assert_eq!(meta.size, 10);
        assert_eq!(meta.content_type, "text/plain");
    }

    #[tokio::test]
    async fn non_recursive_listing_skips_subdirs() {
        let provider = MemoryProvider::new("mem");
        provider.put("dir/a.txt".to_string(), Bytes::new()).await;
        provider
            .put("dir/sub/b.txt".to_string(), Bytes::new())
            .await;
        let options = ListOptions {
            max_keys: 100,
            recursive: false,
        };
        let page = provider.list_page("dir/", &options, None).await.unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].path, "dir/a.txt");
    }

    #[tokio::test]
    async fn connection_test_succeeds_without_error() {
        let provider = MemoryProvider::new("mem");
        let probe = provider.test_connection().await;
        assert!(probe.success);
        assert!(probe.error.is_none());
    }
}
