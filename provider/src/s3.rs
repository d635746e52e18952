use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::any::Any;
use tracing::debug;

use crate::interface::{ListPage, StorageProvider};
use crate::object::{guess_content_type, ListOptions, StorageObject, WriteOptions};
use crate::{ProviderCapabilities, ProviderError, Result};

/// Which S3-compatible vendor an `S3Provider` talks to. The API is the
/// same; capabilities and safe batch sizes differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Flavor {
    Aws,
    DigitalOceanSpaces,
}

#[derive(Debug, Clone, Default)]
pub struct S3Options {
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for non-AWS vendors.
    pub endpoint: Option<String>,
    /// Optional key prefix inside the bucket.
    pub subfolder: String,
}

/// Provider over any S3-compatible API (AWS S3, DigitalOcean Spaces).
pub struct S3Provider {
    handle: String,
    client: Client,
    bucket: String,
    subfolder: String,
    endpoint: Option<String>,
    flavor: S3Flavor,
    capabilities: ProviderCapabilities,
}

impl S3Provider {
    pub async fn new(handle: impl Into<String>, flavor: S3Flavor, opts: S3Options) -> Result<Self> {
        if opts.bucket.is_empty() {
            return Err(ProviderError::Config("bucket is required".to_string()));
        }
        let client = if opts.access_key.is_empty() {
            // Fall back to the standard SDK chain (env vars, profiles,
            // instance role).
            let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
            Client::new(&config)
        } else {
            let credentials = Credentials::new(
                opts.access_key.clone(),
                opts.secret_key.clone(),
                None,
                None,
                "volshift-config",
            );
            let mut builder = aws_sdk_s3::config::Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(Region::new(opts.region.clone()))
                .credentials_provider(credentials);
            if let Some(endpoint) = &opts.endpoint {
                builder = builder.endpoint_url(endpoint).force_path_style(true);
            }
            Client::from_conf(builder.build())
        };

        let capabilities = match flavor {
            S3Flavor::Aws => ProviderCapabilities {
                supports_server_side_copy: true,
                supports_versioning: true,
                supports_streaming: true,
                max_file_size: Some(5 * 1024 * 1024 * 1024 * 1024), // 5TB object limit
                optimal_batch_size: 100,
            },
            S3Flavor::DigitalOceanSpaces => ProviderCapabilities {
                supports_server_side_copy: true,
                supports_versioning: false,
                supports_streaming: true,
                max_file_size: Some(5 * 1024 * 1024 * 1024 * 1024),
                optimal_batch_size: 25,
            },
        };

        Ok(Self {
            handle: handle.into(),
            client,
            bucket: opts.bucket,
            subfolder: opts.subfolder.trim_matches('/').to_string(),
            endpoint: opts.endpoint,
            flavor,
            capabilities,
        })
    }

    fn key(&self, path: &str) -> String {
        if self.subfolder.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.subfolder, path)
        }
    }

    fn strip_key<'a>(&self, key: &'a str) -> &'a str {
        if self.subfolder.is_empty() {
            key
        } else {
            key.strip_prefix(self.subfolder.as_str())
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(key)
        }
    }
}

/// Map an S3 service error onto the provider taxonomy so the engine can
/// tell auth and throttling apart from plain transport failures.
fn classify<E>(op: &str, err: E) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    let code = err.code().unwrap_or_default().to_string();
    let detail = format!("{op}: {code} {err}");
    match code.as_str() {
        "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken" => {
            ProviderError::Auth(detail)
        }
        "SlowDown" | "TooManyRequests" | "RequestLimitExceeded" | "Throttling" => {
            ProviderError::RateLimited(detail)
        }
        _ => ProviderError::Transport(detail),
    }
}

fn smithy_timestamp(ts: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    ts.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

/// CopyObject requires a URL-encoded `bucket/key` source; keys with
/// spaces or `+` fail otherwise. Segments are encoded individually so
/// the path separators survive.
fn encode_copy_source(bucket: &str, key: &str) -> String {
    let encoded: Vec<String> = key
        .split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect();
    format!("{}/{}", bucket, encoded.join("/"))
}

#[async_trait]
impl StorageProvider for S3Provider {
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
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(classify("head_object", service_err))
                }
            }
        }
    }

    async fn metadata(&self, path: &str) -> Result<StorageObject> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
        {
            Ok(resp) => Ok(StorageObject {
                path: path.to_string(),
                size: resp.content_length().unwrap_or(0).max(0) as u64,
                content_type: resp
                    .content_type()
                    .unwrap_or_else(|| guess_content_type(path))
                    .to_string(),
                last_modified: smithy_timestamp(resp.last_modified()),
                version_id: resp.version_id().map(str::to_string),
            }),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Err(ProviderError::NotFound(path.to_string()))
                } else {
                    Err(classify("head_object", service_err))
                }
            }
        }
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
        {
            Ok(resp) => {
                let data = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| ProviderError::Transport(format!("get_object body: {e}")))?;
                Ok(data.into_bytes())
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    Err(ProviderError::NotFound(path.to_string()))
                } else {
                    Err(classify("get_object", service_err))
                }
            }
        }
    }

    async fn read_stream(&self, path: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
        {
            Ok(resp) => Ok(stream::try_unfold(resp.body, |mut body| async move {
                match body.try_next().await {
                    Ok(Some(chunk)) => Ok(Some((chunk, body))),
                    Ok(None) => Ok(None),
                    Err(e) => Err(ProviderError::Transport(format!("get_object stream: {e}"))),
                }
            })
            .boxed()),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    Err(ProviderError::NotFound(path.to_string()))
                } else {
                    Err(classify("get_object", service_err))
                }
            }
        }
    }

    async fn write(&self, path: &str, data: Bytes, options: WriteOptions) -> Result<()> {
        let content_type = options
            .content_type
            .unwrap_or_else(|| guess_content_type(path).to_string());
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| classify("put_object", e.into_service_error()))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|e| classify("delete_object", e.into_service_error()))?;
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        options: &ListOptions,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.key(prefix))
            .max_keys(options.max_keys.min(1000) as i32)
            .set_continuation_token(continuation);
        if !options.recursive {
            request = request.delimiter("/");
        }
        let resp = request
            .send()
            .await
            .map_err(|e| classify("list_objects_v2", e.into_service_error()))?;

        let objects = resp
            .contents()
            .iter()
            .filter_map(|entry| {
                let key = entry.key()?;
                Some(StorageObject {
                    path: self.strip_key(key).to_string(),
                    size: entry.size().unwrap_or(0).max(0) as u64,
                    content_type: guess_content_type(key).to_string(),
                    last_modified: smithy_timestamp(entry.last_modified()),
                    version_id: None,
                })
            })
            .collect();

        Ok(ListPage {
            objects,
            continuation: resp.next_continuation_token().map(str::to_string),
        })
    }

    async fn server_side_copy(
        &self,
        from: &str,
        target: &dyn StorageProvider,
        to: &str,
    ) -> Result<bool> {
        let Some(other) = target.as_any().downcast_ref::<S3Provider>() else {
            return Ok(false);
        };
        // Server-side copy only works within one vendor endpoint; the
        // target's credentials must be able to read the source bucket.
        if other.flavor != self.flavor || other.endpoint != self.endpoint {
            return Ok(false);
        }
        let copy_source = encode_copy_source(&self.bucket, &self.key(from));
        debug!(from = %copy_source, to = %other.key(to), "server-side copy");
        match other
            .client
            .copy_object()
            .bucket(&other.bucket)
            .key(other.key(to))
            .copy_source(&copy_source)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.code() == Some("NoSuchKey") {
                    Err(ProviderError::NotFound(from.to_string()))
                } else {
                    Err(classify("copy_object", service_err))
                }
            }
        }
    }
}
