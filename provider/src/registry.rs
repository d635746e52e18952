use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::interface::StorageProvider;
use crate::local::LocalProvider;
use crate::memory::MemoryProvider;
use crate::s3::{S3Flavor, S3Options, S3Provider};
use crate::{ProviderError, Result};

/// Connection settings for one provider instance, as they appear in the
/// tool configuration. Which keys are required depends on the type tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub subfolder: String,
    /// Root directory, for the `local` type.
    #[serde(default)]
    pub path: String,
}

impl ProviderSettings {
    fn require(&self, field: &str, value: &str, tag: &str) -> Result<()> {
        if value.is_empty() {
            Err(ProviderError::Config(format!(
                "provider type '{tag}' requires '{field}'"
            )))
        } else {
            Ok(())
        }
    }
}

type Factory = Arc<
    dyn Fn(String, ProviderSettings) -> BoxFuture<'static, Result<Arc<dyn StorageProvider>>>
        + Send
        + Sync,
>;

/// Tagged factory for provider instances. Registering a new type is
/// purely additive; callers only ever go through `create`.
pub struct ProviderRegistry {
    factories: HashMap<String, Factory>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register("s3", |handle, settings| {
            Box::pin(async move {
                settings.require("bucket", &settings.bucket, "s3")?;
                settings.require("region", &settings.region, "s3")?;
                let provider = S3Provider::new(
                    handle,
                    S3Flavor::Aws,
                    S3Options {
                        access_key: settings.access_key,
                        secret_key: settings.secret_key,
                        bucket: settings.bucket,
                        region: settings.region,
                        endpoint: settings.endpoint,
                        subfolder: settings.subfolder,
                    },
                )
                .await?;
                Ok(Arc::new(provider) as Arc<dyn StorageProvider>)
            })
        });

        registry.register("digitalocean-spaces", |handle, settings| {
            Box::pin(async move {
                settings.require("bucket", &settings.bucket, "digitalocean-spaces")?;
                settings.require("region", &settings.region, "digitalocean-spaces")?;
                settings.require("access_key", &settings.access_key, "digitalocean-spaces")?;
                let endpoint = settings.endpoint.clone().unwrap_or_else(|| {
                    format!("https://{}.digitaloceanspaces.com", settings.region)
                });
                let provider = S3Provider::new(
                    handle,
                    S3Flavor::DigitalOceanSpaces,
                    S3Options {
                        access_key: settings.access_key,
                        secret_key: settings.secret_key,
                        bucket: settings.bucket,
                        region: settings.region,
                        endpoint: Some(endpoint),
                        subfolder: settings.subfolder,
                    },
                )
                .await?;
                Ok(Arc::new(provider) as Arc<dyn StorageProvider>)
            })
        });

        registry.register("local", |handle, settings| {
            Box::pin(async move {
                settings.require("path", &settings.path, "local")?;
                let provider = LocalProvider::new(handle, settings.path.clone()).await?;
                Ok(Arc::new(provider) as Arc<dyn StorageProvider>)
            })
        });

        registry.register("memory", |handle, _settings| {
            Box::pin(async move {
                Ok(Arc::new(MemoryProvider::new(handle)) as Arc<dyn StorageProvider>)
            })
        });

        registry
    }

    pub fn register<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(String, ProviderSettings) -> BoxFuture<'static, Result<Arc<dyn StorageProvider>>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(tag.to_string(), Arc::new(factory));
    }

    pub fn known_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub async fn create(
        &self,
        tag: &str,
        handle: &str,
        settings: &ProviderSettings,
    ) -> Result<Arc<dyn StorageProvider>> {
        let factory = self.factories.get(tag).ok_or_else(|| {
            ProviderError::Config(format!("unknown provider type '{tag}'"))
        })?;
        debug!(tag, handle, "constructing provider");
        factory(handle.to_string(), settings.clone()).await
    }
}
