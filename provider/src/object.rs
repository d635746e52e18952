use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable snapshot of one object at a path within a provider.
/// Re-fetched when fresh state is needed, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageObject {
    /// Slash-separated path relative to the provider root.
    pub path: String,
    pub size: u64,
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
    pub version_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub content_type: Option<String>,
}

impl WriteOptions {
    pub fn content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub max_keys: usize,
    pub recursive: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            max_keys: 1000,
            recursive: true,
        }
    }
}

/// Best-effort content type from the file extension. Providers that do not
/// persist a content type (local disk, bare listings) fall back to this.
pub fn guess_content_type(path: &str) -> &'static str {
    let ext = path
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "xml" => "application/xml",
        "zip" => "application/zip",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}
