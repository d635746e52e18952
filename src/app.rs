use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use diagnostics::{ComparisonReport, ConnectionResults, FileCheck};
use migration::{
    CheckpointStatus, CheckpointStore, CleanupReport, LockStore, MigrateOptions, MigrationEngine,
    MigrationReport, RollbackReport, VolumeAssetCatalog,
};
use provider::{ListOptions, ProviderRegistry, StorageObject, StorageProvider};
use switchover::{FileVolumeStore, SwitchPlan, VolumeMapping};

use crate::config::AppConfig;
use crate::error::{Result, VolshiftError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDirection {
    Preview,
    ToTarget,
    ToSource,
}

/// Everything a subcommand needs, built once from the config file: the
/// full provider table plus the source and target roles.
pub struct App {
    config: AppConfig,
    source: Arc<dyn StorageProvider>,
    target: Arc<dyn StorageProvider>,
    providers: Vec<(String, Arc<dyn StorageProvider>)>,
}

impl App {
    pub async fn bootstrap(config: AppConfig) -> Result<Self> {
        let registry = ProviderRegistry::new();
        let mut providers = Vec::new();
        for (handle, definition) in &config.providers {
            let provider = registry
                .create(&definition.kind, handle, &definition.settings)
                .await?;
            providers.push((handle.clone(), provider));
        }
        info!(count = providers.len(), "providers configured");

        let source = lookup(&providers, &config.source)?;
        let target = lookup(&providers, &config.target)?;
        Ok(Self {
            config,
            source,
            target,
            providers,
        })
    }

    pub fn provider(&self, handle: &str) -> Result<Arc<dyn StorageProvider>> {
        lookup(&self.providers, handle)
    }

    pub fn source(&self) -> &Arc<dyn StorageProvider> {
        &self.source
    }

    async fn engine(&self) -> Result<MigrationEngine> {
        let checkpoints = CheckpointStore::open(&self.config.state_dir).await?;
        let locks = LockStore::open(
            &self.config.state_dir,
            Duration::from_secs(self.config.lock_ttl_hours * 3600),
        )
        .await?;
        let catalog = Arc::new(VolumeAssetCatalog::new(
            self.source.clone(),
            self.config.volume_prefixes.clone(),
        ));
        Ok(MigrationEngine::new(
            self.source.clone(),
            self.target.clone(),
            catalog,
            checkpoints,
            locks,
        ))
    }

    pub async fn migrate(&self, opts: &MigrateOptions) -> Result<MigrationReport> {
        Ok(self.engine().await?.run(opts).await?)
    }

    pub async fn status(&self, checkpoint_id: Option<&str>) -> Result<CheckpointStatus> {
        Ok(self.engine().await?.status(checkpoint_id).await?)
    }

    pub async fn rollback(&self, checkpoint_id: &str) -> Result<RollbackReport> {
        Ok(self.engine().await?.rollback(checkpoint_id).await?)
    }

    pub async fn cleanup(&self, older_than_hours: Option<u64>, force: bool) -> Result<CleanupReport> {
        let hours = older_than_hours.unwrap_or(self.config.retention_hours);
        Ok(self
            .engine()
            .await?
            .cleanup(Duration::from_secs(hours * 3600), force)
            .await?)
    }

    pub async fn switch(&self, direction: SwitchDirection) -> Result<SwitchPlan> {
        let store = FileVolumeStore::open(self.config.volumes_file());
        let mapping = VolumeMapping::new(self.config.volume_mappings.clone());
        let handles = self.config.handles();
        let plan = match direction {
            SwitchDirection::Preview => switchover::preview(&store, &mapping, &handles).await?,
            SwitchDirection::ToTarget => switchover::switch(&store, &mapping, &handles).await?,
            SwitchDirection::ToSource => {
                switchover::switch(&store, &mapping.invert(), &handles).await?
            }
        };
        Ok(plan)
    }

    pub async fn probe(&self) -> ConnectionResults {
        diagnostics::probe_all(&self.providers).await
    }

    pub async fn list(&self, handle: Option<&str>, prefix: &str) -> Result<Vec<StorageObject>> {
        let provider = match handle {
            Some(handle) => self.provider(handle)?,
            None => self.source.clone(),
        };
        Ok(provider
            .as_ref()
            .list_all(prefix, ListOptions::default())
            .await?)
    }

    pub async fn check(&self, handle: Option<&str>, path: &str) -> Result<FileCheck> {
        let provider = match handle {
            Some(handle) => self.provider(handle)?,
            None => self.source.clone(),
        };
        Ok(diagnostics::check_file(provider.as_ref(), path).await?)
    }

    pub async fn compare(&self, prefix: &str) -> Result<ComparisonReport> {
        Ok(diagnostics::compare(self.source.as_ref(), self.target.as_ref(), prefix).await?)
    }
}

fn lookup(
    providers: &[(String, Arc<dyn StorageProvider>)],
    handle: &str,
) -> Result<Arc<dyn StorageProvider>> {
    providers
        .iter()
        .find(|(h, _)| h == handle)
        .map(|(_, p)| p.clone())
        .ok_or_else(|| VolshiftError::Config(format!("unknown provider handle '{handle}'")))
}
