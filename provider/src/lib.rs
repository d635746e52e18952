mod interface;
mod local;
mod memory;
mod object;
mod registry;
mod s3;

pub use interface::{copy_object, CopyMode, ListPage, StorageProvider};
pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use object::{guess_content_type, ListOptions, StorageObject, WriteOptions};
pub use registry::{ProviderRegistry, ProviderSettings};
pub use s3::{S3Flavor, S3Options, S3Provider};

use serde::Serialize;
use std::collections::BTreeMap;

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid provider configuration: {0}")]
    Config(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("integrity mismatch: {0}")]
    Integrity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    /// Whether retrying the same call with backoff has any chance of
    /// succeeding. Config and not-found errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transport(_) | ProviderError::RateLimited(_) | ProviderError::Io(_)
        )
    }
}

/// Static capability descriptor, fixed for the lifetime of a provider
/// instance. The migration engine negotiates its batch size from
/// `optimal_batch_size` and gates streaming reads on `supports_streaming`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderCapabilities {
    pub supports_server_side_copy: bool,
    pub supports_versioning: bool,
    pub supports_streaming: bool,
    /// None means unbounded.
    pub max_file_size: Option<u64>,
    pub optimal_batch_size: usize,
}

/// Outcome of a connectivity probe. Never surfaced as an error so that
/// batch diagnostics can keep going past one bad provider.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
    pub response_time_seconds: f64,
    pub details: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl ConnectionTest {
    pub fn ok(message: impl Into<String>, response_time_seconds: f64) -> Self {
        Self {
            success: true,
            message: message.into(),
            response_time_seconds,
            details: BTreeMap::new(),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, response_time_seconds: f64, error: String) -> Self {
        Self {
            success: false,
            message: message.into(),
            response_time_seconds,
            details: BTreeMap::new(),
            error: Some(error),
        }
    }
}
