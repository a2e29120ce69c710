use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::ZfsConfig;
use crate::error::{ProviderConfigError, VolumeError};
use crate::volume::{Volume, VolumeProvider};

pub const KIND: &str = "zfs";

/// Metadata key naming the dataset new volumes are created under.
pub const PARENT_DATASET: &str = "parent_dataset";

/// Dataset operations the zfs provider needs from the system.
#[async_trait]
pub trait DatasetOps: Send + Sync {
    /// Succeeds if `name` exists.
    async fn check_dataset(&self, name: &str) -> io::Result<()>;

    /// Create `name` and return its mountpoint.
    async fn create_dataset(&self, name: &str) -> io::Result<PathBuf>;

    async fn snapshot_dataset(&self, dataset: &str, snapshot: &str) -> io::Result<()>;
}

/// [`DatasetOps`] backed by the `zfs` command line tool.
#[derive(Debug, Clone)]
pub struct ZfsCli {
    config: ZfsConfig,
}

impl ZfsCli {
    pub fn new(config: ZfsConfig) -> Self {
        Self { config }
    }

    async fn zfs(&self, args: &[&str]) -> io::Result<String> {
        tracing::debug!(binary = %self.config.binary, ?args, "Running zfs");
        let output = Command::new(&self.config.binary).args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(io::Error::other(format!(
                "zfs {} failed ({}): {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl DatasetOps for ZfsCli {
    async fn check_dataset(&self, name: &str) -> io::Result<()> {
        self.zfs(&["list", "-H", "-o", "name", name]).await.map(|_| ())
    }

    async fn create_dataset(&self, name: &str) -> io::Result<PathBuf> {
        self.zfs(&["create", "-p", name]).await?;
        let mountpoint = self.zfs(&["get", "-H", "-o", "value", "mountpoint", name]).await?;
        Ok(PathBuf::from(mountpoint))
    }

    async fn snapshot_dataset(&self, dataset: &str, snapshot: &str) -> io::Result<()> {
        self.zfs(&["snapshot", &format!("{}@{}", dataset, snapshot)])
            .await
            .map(|_| ())
    }
}

/// Copy-on-write volumes as child datasets of a parent dataset.
///
/// Each volume is `<parent>/<volume id>`; snapshots are zfs snapshots of
/// that dataset and surface under its `.zfs/snapshot` directory.
pub struct ZfsProvider {
    parent_dataset: String,
    ops: Arc<dyn DatasetOps>,
    /// volume id -> dataset name, for volumes that are not snapshots
    datasets: Mutex<HashMap<String, String>>,
}

impl ZfsProvider {
    pub async fn new(
        parent_dataset: String,
        ops: Arc<dyn DatasetOps>,
    ) -> Result<Self, ProviderConfigError> {
        if let Err(e) = ops.check_dataset(&parent_dataset).await {
            tracing::error!(
                parent_dataset = %parent_dataset,
                error = %e,
                "Parent dataset unavailable"
            );
            return Err(ProviderConfigError::Backend(e.to_string()));
        }
        Ok(Self {
            parent_dataset,
            ops,
            datasets: Mutex::new(HashMap::new()),
        })
    }

    pub fn parent_dataset(&self) -> &str {
        &self.parent_dataset
    }
}

#[async_trait]
impl VolumeProvider for ZfsProvider {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(PARENT_DATASET.to_string(), self.parent_dataset.clone())])
    }

    async fn new_volume(&self) -> Result<Volume, VolumeError> {
        let id = Uuid::new_v4().to_string();
        let dataset = format!("{}/{}", self.parent_dataset, id);
        let location = self
            .ops
            .create_dataset(&dataset)
            .await
            .map_err(|e| VolumeError::Backend(e.to_string()))?;

        self.datasets.lock().insert(id.clone(), dataset);
        Ok(Volume {
            id,
            location,
            snapshot_of: None,
            created_at: Utc::now(),
        })
    }

    async fn snapshot(&self, volume: &Volume) -> Result<Volume, VolumeError> {
        let dataset = self
            .datasets
            .lock()
            .get(&volume.id)
            .cloned()
            .ok_or_else(|| {
                VolumeError::Backend(format!(
                    "volume {} is a snapshot or was not issued by this provider",
                    volume.id
                ))
            })?;

        let id = Uuid::new_v4().to_string();
        self.ops
            .snapshot_dataset(&dataset, &id)
            .await
            .map_err(|e| VolumeError::Backend(e.to_string()))?;

        Ok(Volume {
            location: volume.location.join(".zfs").join("snapshot").join(&id),
            id,
            snapshot_of: Some(volume.id.clone()),
            created_at: Utc::now(),
        })
    }
}
