use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{stream, StreamExt, TryStreamExt};
use std::any::Any;
use std::collections::VecDeque;
use std::time::Instant;

use crate::object::{ListOptions, StorageObject, WriteOptions};
use crate::{ConnectionTest, ProviderCapabilities, ProviderError, Result};

/// One page of a listing. Pagination tokens are provider-specific and
/// opaque to callers; `StorageProvider::list` hides them entirely.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub objects: Vec<StorageObject>,
    pub continuation: Option<String>,
}

/// Uniform contract over heterogeneous object stores. Absence is a value
/// at this boundary: `object_exists` returns `Ok(false)` for a missing
/// object and only fails on transport or auth problems, while `metadata`
/// fails with `ProviderError::NotFound`.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Stable handle this instance is known by (the host system's
    /// filesystem-handle name).
    fn handle(&self) -> &str;

    fn capabilities(&self) -> &ProviderCapabilities;

    /// Same-vendor detection for server-side copy.
    fn as_any(&self) -> &dyn Any;

    async fn object_exists(&self, path: &str) -> Result<bool>;

    async fn metadata(&self, path: &str) -> Result<StorageObject>;

    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Streaming read. Callers must check `capabilities().supports_streaming`
    /// first and fall back to buffered `read`.
    async fn read_stream(&self, path: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let _ = path;
        Err(ProviderError::Unsupported(format!(
            "provider '{}' does not support streaming reads",
            self.handle()
        )))
    }

    /// Fully overwrites any existing object at `path`.
    async fn write(&self, path: &str, data: Bytes, options: WriteOptions) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// One page of objects under `prefix`. `continuation` of `None` starts
    /// from the beginning; the returned token of `None` ends the listing.
    async fn list_page(
        &self,
        prefix: &str,
        options: &ListOptions,
        continuation: Option<String>,
    ) -> Result<ListPage>;

    /// Copy `from` on this provider to `to` on `target` without the bytes
    /// transiting the caller, when both sides are the same vendor/endpoint.
    /// Returns `Ok(false)` when this provider cannot do it, in which case
    /// the caller degrades to read-then-write.
    async fn server_side_copy(
        &self,
        from: &str,
        target: &dyn StorageProvider,
        to: &str,
    ) -> Result<bool> {
        let _ = (from, target, to);
        Ok(false)
    }

    async fn file_size(&self, path: &str) -> Result<u64> {
        Ok(self.metadata(path).await?.size)
    }

    async fn mime_type(&self, path: &str) -> Result<String> {
        Ok(self.metadata(path).await?.content_type)
    }

    async fn last_modified(&self, path: &str) -> Result<DateTime<Utc>> {
        Ok(self.metadata(path).await?.last_modified)
    }

    /// Connectivity probe. Never fails; failure is captured in the result
    /// so batch diagnostics continue past one bad provider.
    async fn test_connection(&self) -> ConnectionTest {
        let options = ListOptions {
            max_keys: 1,
            recursive: true,
        };
        let started = Instant::now();
        match self.list_page("", &options, None).await {
            Ok(_) => ConnectionTest::ok(
                format!("provider '{}' reachable", self.handle()),
                started.elapsed().as_secs_f64(),
            ),
            Err(e) => ConnectionTest::failed(
                format!("provider '{}' unreachable", self.handle()),
                started.elapsed().as_secs_f64(),
                e.to_string(),
            ),
        }
    }
}

struct ListState<'a> {
    provider: &'a dyn StorageProvider,
    prefix: String,
    options: ListOptions,
    continuation: Option<String>,
    buffered: VecDeque<StorageObject>,
    exhausted: bool,
}

impl dyn StorageProvider + '_ {
    /// Lazy listing over `list_page`. Restartable and finite per call;
    /// pagination is invisible to the caller.
    pub fn list<'a>(
        &'a self,
        prefix: &str,
        options: ListOptions,
    ) -> BoxStream<'a, Result<StorageObject>> {
        let state = ListState {
            provider: self,
            prefix: prefix.to_string(),
            options,
            continuation: None,
            buffered: VecDeque::new(),
            exhausted: false,
        };
        stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(object) = state.buffered.pop_front() {
                    return Ok(Some((object, state)));
                }
                if state.exhausted {
                    return Ok(None);
                }
                let page = state
                    .provider
                    .list_page(
                        &state.prefix,
                        &state.options,
                        state.continuation.take(),
                    )
                    .await?;
                state.exhausted = page.continuation.is_none();
                state.continuation = page.continuation;
                state.buffered.extend(page.objects);
                if state.buffered.is_empty() && state.exhausted {
                    return Ok(None);
                }
            }
        })
        .boxed()
    }

    /// Collect an entire listing. Convenience for diagnostics and small
    /// catalogs; migrations stream instead.
    pub async fn list_all(&self, prefix: &str, options: ListOptions) -> Result<Vec<StorageObject>> {
        self.list(prefix, options).try_collect().await
    }
}

/// How a copy was performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// No bytes transited this process.
    ServerSide,
    /// Read from source, written to target by this process.
    Streamed,
}

/// The single seam hiding same-vendor vs cross-vendor copy cost from the
/// migration engine: server-side copy when the source declares the
/// capability and the vendors match, buffered read-then-write otherwise.
pub async fn copy_object(
    source: &dyn StorageProvider,
    from: &str,
    target: &dyn StorageProvider,
    to: &str,
) -> Result<CopyMode> {
    if source.capabilities().supports_server_side_copy
        && source.server_side_copy(from, target, to).await?
    {
        return Ok(CopyMode::ServerSide);
    }

    let meta = source.metadata(from).await?;
    let data = if source.capabilities().supports_streaming {
        let mut stream = source.read_stream(from).await?;
        let mut buf = BytesMut::with_capacity(meta.size as usize);
        while let Some(chunk) = stream.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    } else {
        source.read(from).await?
    };
    target
        .write(to, data, WriteOptions::content_type(meta.content_type))
        .await?;
    Ok(CopyMode::Streamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryProvider;

    #[tokio::test]
    async fn list_hides_pagination() {
        let provider = MemoryProvider::new("mem");
        for i in 0..25 {
            provider
                .put(format!("assets/file-{i:03}.png"), Bytes::from_static(b"x"))
                .await;
        }
        let options = ListOptions {
            max_keys: 7,
            recursive: true,
        };
        let all = (&provider as &dyn StorageProvider)
            .list_all("assets/", options)
            .await
            .unwrap();
        assert_eq!(all.len(), 25);
        assert_eq!(all[0].path, "assets/file-000.png");
        assert_eq!(all[24].path, "assets/file-024.png");
    }

    #[tokio::test]
    async fn copy_falls_back_to_read_then_write() {
        let source = MemoryProvider::new("src");
        let target = MemoryProvider::new("dst");
        source
            .put("images/a.jpg".to_string(), Bytes::from_static(b"payload"))
            .await;

        let mode = copy_object(&source, "images/a.jpg", &target, "images/a.jpg")
            .await
            .unwrap();
        assert_eq!(mode, CopyMode::Streamed);
        assert_eq!(
            target.read("images/a.jpg").await.unwrap(),
            Bytes::from_static(b"payload")
        );
        let meta = target.metadata("images/a.jpg").await.unwrap();
        assert_eq!(meta.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn copy_missing_source_is_not_found() {
        let source = MemoryProvider::new("src");
        let target = MemoryProvider::new("dst");
        let err = copy_object(&source, "nope.bin", &target, "nope.bin")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
