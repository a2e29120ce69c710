//! Pluggable volume providers and the registry that issues volumes from them.

pub mod manager;
pub mod zfs;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProviderConfigError, VolumeError};

pub use manager::VolumeManager;
pub use zfs::{DatasetOps, ZfsCli, ZfsProvider, PARENT_DATASET};

/// A unit of storage issued by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub location: PathBuf,
    /// ID of the volume this is a snapshot of, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_of: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait VolumeProvider: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Configuration the provider was built from.
    fn metadata(&self) -> BTreeMap<String, String>;

    async fn new_volume(&self) -> Result<Volume, VolumeError>;

    async fn snapshot(&self, volume: &Volume) -> Result<Volume, VolumeError>;
}

/// Request to construct and register a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Registry key. Defaults to `kind` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ProviderSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn provider_id(&self) -> Result<String, ProviderConfigError> {
        match &self.id {
            Some(id) if id.trim().is_empty() => Err(ProviderConfigError::BlankId),
            Some(id) => Ok(id.clone()),
            None => Ok(self.kind.clone()),
        }
    }
}

/// Builds providers from specs, validating the configuration per kind.
#[derive(Clone)]
pub struct ProviderFactory {
    datasets: Arc<dyn DatasetOps>,
}

impl ProviderFactory {
    pub fn new(datasets: Arc<dyn DatasetOps>) -> Self {
        Self { datasets }
    }

    pub async fn build(
        &self,
        spec: &ProviderSpec,
    ) -> Result<Arc<dyn VolumeProvider>, ProviderConfigError> {
        match spec.kind.trim() {
            "" => Err(ProviderConfigError::BlankKind),
            zfs::KIND => {
                let parent = spec
                    .metadata
                    .get(PARENT_DATASET)
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| ProviderConfigError::MissingParameter {
                        kind: zfs::KIND.to_string(),
                        param: PARENT_DATASET,
                    })?;
                let provider = ZfsProvider::new(parent.clone(), self.datasets.clone()).await?;
                Ok(Arc::new(provider))
            }
            other => Err(ProviderConfigError::UnknownKind(other.to_string())),
        }
    }
}
