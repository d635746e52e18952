use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::any::Any;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::interface::{ListPage, StorageProvider};
use crate::object::{guess_content_type, ListOptions, StorageObject, WriteOptions};
use crate::{ProviderCapabilities, ProviderError, Result};

const STREAM_CHUNK: usize = 64 * 1024;

/// Directory-rooted provider over the local filesystem. Object paths map
/// to file paths below the root.
pub struct LocalProvider {
    handle: String,
    root: PathBuf,
    capabilities: ProviderCapabilities,
}

impl LocalProvider {
    pub async fn new(handle: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            handle: handle.into(),
            root,
            capabilities: ProviderCapabilities {
                supports_server_side_copy: true,
                supports_versioning: false,
                supports_streaming: true,
                max_file_size: None,
                optimal_batch_size: 50,
            },
        })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.split('/').any(|seg| seg == "..") {
            return Err(ProviderError::Config(format!(
                "path escapes provider root: {path}"
            )));
        }
        Ok(self.root.join(path))
    }

    async fn stat(&self, path: &str) -> Result<StorageObject> {
        let file = self.resolve(path)?;
        match fs::metadata(&file).await {
            Ok(meta) if meta.is_file() => Ok(StorageObject {
                path: path.to_string(),
                size: meta.len(),
                content_type: guess_content_type(path).to_string(),
                last_modified: meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
                version_id: None,
            }),
            Ok(_) => Err(ProviderError::NotFound(path.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProviderError::NotFound(path.to_string()))
            }
            Err(e) => Err(ProviderError::Io(e)),
        }
    }

    /// All file paths below the root, relative and slash-separated,
    /// sorted. Listing pages are cut from this snapshot.
    async fn collect_paths(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ProviderError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    if let Some(rel) = relative_path(&self.root, &entry.path()) {
                        found.push(rel);
                    }
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

fn relative_path(root: &Path, full: &Path) -> Option<String> {
    let rel = full.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[async_trait]
impl StorageProvider for LocalProvider {
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
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(ProviderError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn metadata(&self, path: &str) -> Result<StorageObject> {
        self.stat(path).await
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let file = self.resolve(path)?;
        match fs::read(&file).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProviderError::NotFound(path.to_string()))
            }
            Err(e) => Err(ProviderError::Io(e)),
        }
    }

    async fn read_stream(&self, path: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let file = self.resolve(path)?;
        let file = match fs::File::open(&file).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::NotFound(path.to_string()))
            }
            Err(e) => return Err(ProviderError::Io(e)),
        };
        Ok(stream::try_unfold(file, |mut file| async move {
            let mut buf = vec![0u8; STREAM_CHUNK];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                Ok(None)
            } else {
                buf.truncate(n);
                Ok(Some((Bytes::from(buf), file)))
            }
        })
        .boxed())
    }

    async fn write(&self, path: &str, data: Bytes, _options: WriteOptions) -> Result<()> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&file, &data).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let file = self.resolve(path)?;
        match fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProviderError::Io(e)),
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        options: &ListOptions,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let all = self.collect_paths().await?;
        let mut page = Vec::new();
        let mut last = None;
        for path in all {
            if !path.starts_with(prefix) {
                continue;
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
                return Ok(ListPage {
                    objects: page,
                    continuation: last,
                });
            }
            let object = self.stat(&path).await?;
            last = Some(path);
            page.push(object);
        }
        Ok(ListPage {
            objects: page,
            continuation: None,
        })
    }

    async fn server_side_copy(
        &self,
        from: &str,
        target: &dyn StorageProvider,
        to: &str,
    ) -> Result<bool> {
        let Some(other) = target.as_any().downcast_ref::<LocalProvider>() else {
            return Ok(false);
        };
        let source_file = self.resolve(from)?;
        let target_file = other.resolve(to)?;
        if let Some(parent) = target_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::copy(&source_file, &target_file).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProviderError::NotFound(from.to_string()))
            }
            Err(e) => Err(ProviderError::Io(e)),
        }
    }
}
