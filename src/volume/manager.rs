use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::VolumeError;
use crate::volume::{Volume, VolumeProvider};

struct IssuedVolume {
    provider_id: String,
    volume: Volume,
}

/// Registry of volume providers keyed by provider ID.
#[derive(Default)]
pub struct VolumeManager {
    providers: RwLock<HashMap<String, Arc<dyn VolumeProvider>>>,
    volumes: RwLock<HashMap<String, IssuedVolume>>,
}

impl VolumeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. An existing registration is never replaced.
    pub fn add_provider(
        &self,
        id: impl Into<String>,
        provider: Arc<dyn VolumeProvider>,
    ) -> Result<(), VolumeError> {
        let id = id.into();
        let mut providers = self.providers.write();
        if providers.contains_key(&id) {
            return Err(VolumeError::ProviderAlreadyExists(id));
        }
        tracing::info!(provider_id = %id, kind = provider.kind(), "Volume provider registered");
        providers.insert(id, provider);
        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<Arc<dyn VolumeProvider>> {
        self.providers.read().get(id).cloned()
    }

    /// Registered provider IDs, sorted.
    pub fn list_providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn new_volume_from_provider(&self, provider_id: &str) -> Result<Volume, VolumeError> {
        let provider = self
            .provider(provider_id)
            .ok_or_else(|| VolumeError::NoSuchProvider(provider_id.to_string()))?;

        let volume = provider.new_volume().await?;
        tracing::info!(provider_id, volume_id = %volume.id, "Volume created");
        self.record(provider_id, &volume);
        Ok(volume)
    }

    /// Snapshot a volume through the provider that issued it.
    pub async fn snapshot(&self, volume_id: &str) -> Result<Volume, VolumeError> {
        let (provider_id, volume) = {
            let volumes = self.volumes.read();
            let issued = volumes
                .get(volume_id)
                .ok_or_else(|| VolumeError::NoSuchVolume(volume_id.to_string()))?;
            (issued.provider_id.clone(), issued.volume.clone())
        };
        let provider = self
            .provider(&provider_id)
            .ok_or_else(|| VolumeError::NoSuchProvider(provider_id.clone()))?;

        let snapshot = provider.snapshot(&volume).await?;
        tracing::info!(volume_id, snapshot_id = %snapshot.id, "Volume snapshot taken");
        self.record(&provider_id, &snapshot);
        Ok(snapshot)
    }

    pub fn get_volume(&self, id: &str) -> Option<Volume> {
        self.volumes.read().get(id).map(|issued| issued.volume.clone())
    }

    fn record(&self, provider_id: &str, volume: &Volume) {
        self.volumes.write().insert(
            volume.id.clone(),
            IssuedVolume {
                provider_id: provider_id.to_string(),
                volume: volume.clone(),
            },
        );
    }
}
