use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use provider::ProviderSettings;

use crate::error::{Result, VolshiftError};

/// One configured provider: a registry tag plus its settings, keyed in
/// the config file by handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub settings: ProviderSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Handle -> provider definition. Handles are the stable names that
    /// volumes, checkpoints, and mappings refer to.
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Handle of the provider being drained.
    pub source: String,
    /// Handle of the provider being filled.
    pub target: String,
    /// Source handle -> target handle pairs applied at switch-over.
    #[serde(default)]
    pub volume_mappings: BTreeMap<String, String>,
    /// Prefixes that bound asset discovery; empty means everything.
    #[serde(default)]
    pub volume_prefixes: Vec<String>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Volume registry document; defaults to volumes.json in state_dir.
    #[serde(default)]
    pub volumes_file: Option<PathBuf>,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_lock_ttl_hours")]
    pub lock_ttl_hours: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".volshift")
}

fn default_retention_hours() -> u64 {
    72
}

fn default_lock_ttl_hours() -> u64 {
    4
}

impl AppConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read(path.as_ref()).await.map_err(|e| {
            VolshiftError::Config(format!(
                "cannot read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: AppConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (role, handle) in [("source", &self.source), ("target", &self.target)] {
            if !self.providers.contains_key(handle) {
                return Err(VolshiftError::Config(format!(
                    "{role} handle '{handle}' is not defined under providers"
                )));
            }
        }
        for (from, to) in &self.volume_mappings {
            for handle in [from, to] {
                if !self.providers.contains_key(handle) {
                    return Err(VolshiftError::Config(format!(
                        "volume mapping references unknown handle '{handle}'"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn volumes_file(&self) -> PathBuf {
        self.volumes_file
            .clone()
            .unwrap_or_else(|| self.state_dir.join("volumes.json"))
    }

    pub fn handles(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}
