//! Keeper configuration loaded from a JSON file.
//!
//! ```json
//! {
//!   "server_id": 1,
//!   "disks": {
//!     "local": { "type": "local", "path": "/var/lib/keeper" },
//!     "cold": {
//!       "type": "object_storage",
//!       "provider": "azure_blob_storage",
//!       "endpoint": "http://azurite:10000/devstoreaccount1",
//!       "container": "cont",
//!       "endpoint_subpath": "cont/logs",
//!       "allow_http": true
//!     }
//!   },
//!   "latest_log_storage_disk": "local",
//!   "log_storage_disk": "cold",
//!   "snapshot_storage_disk": "local",
//!   "coordination_settings": { "rotate_log_storage_interval": 3 }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, DiskError};
use crate::traits::DiskResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiskConfig {
    Local(LocalDiskConfig),
    ObjectStorage(ObjectStorageConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDiskConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStorageProvider {
    AzureBlobStorage,
    S3,
    LocalFs,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    pub provider: ObjectStorageProvider,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Container (Azure) or bucket (S3).
    #[serde(default, alias = "bucket")]
    pub container: Option<String>,
    /// Root prefix inside the container; every key of this disk lives below it.
    #[serde(default)]
    pub endpoint_subpath: Option<String>,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub account_key: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
    /// Directory for the `local_fs` provider.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl ObjectStorageConfig {
    pub fn container_name(&self) -> DiskResult<&str> {
        self.container
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| DiskError::Config(format!("{:?} disk needs a container", self.provider)))
    }
}

/// Log, snapshot and rotation tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationSettings {
    pub operation_timeout_ms: u64,
    pub session_timeout_ms: u64,
    /// Applied entries between two snapshots.
    pub snapshot_distance: u64,
    /// Lag after which a follower would be fed a snapshot instead of entries.
    pub stale_log_gap: u64,
    /// Entries kept in the log behind the last snapshot and on the hot tier.
    pub reserved_log_items: u64,
    /// Entries per segment before it is sealed.
    pub rotate_log_storage_interval: u64,
    /// Seal a non-empty active segment after this long, 0 disables.
    pub rotate_period_ms: u64,
    /// Seal the active segment once it reaches this many bytes.
    pub max_log_file_size: u64,
    pub snapshots_to_keep: usize,
    pub rotation_check_interval_ms: u64,
    pub write_retries: u32,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 10_000,
            session_timeout_ms: 30_000,
            snapshot_distance: 100_000,
            stale_log_gap: 10_000,
            reserved_log_items: 100_000,
            rotate_log_storage_interval: 100_000,
            rotate_period_ms: 0,
            max_log_file_size: 50 * 1024 * 1024,
            snapshots_to_keep: 3,
            rotation_check_interval_ms: 1_000,
            write_retries: 3,
        }
    }
}

impl CoordinationSettings {
    pub fn rotate_period(&self) -> Option<Duration> {
        (self.rotate_period_ms > 0).then(|| Duration::from_millis(self.rotate_period_ms))
    }

    pub fn rotation_check_interval(&self) -> Duration {
        Duration::from_millis(self.rotation_check_interval_ms.max(1))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_server_id() -> u64 {
    1
}

fn default_disk_name() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeeperConfig {
    #[serde(default = "default_server_id")]
    pub server_id: u64,
    pub disks: HashMap<String, DiskConfig>,
    #[serde(default = "default_disk_name")]
    pub log_storage_disk: String,
    #[serde(default = "default_disk_name")]
    pub latest_log_storage_disk: String,
    #[serde(default = "default_disk_name")]
    pub snapshot_storage_disk: String,
    #[serde(default)]
    pub coordination_settings: CoordinationSettings,
    #[serde(default)]
    pub create_snapshot_on_exit: bool,
}

impl KeeperConfig {
    /// A config with one local disk named `default` serving every role.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        let mut disks = HashMap::new();
        disks.insert(
            default_disk_name(),
            DiskConfig::Local(LocalDiskConfig { path: path.into() }),
        );
        Self {
            server_id: default_server_id(),
            disks,
            log_storage_disk: default_disk_name(),
            latest_log_storage_disk: default_disk_name(),
            snapshot_storage_disk: default_disk_name(),
            coordination_settings: CoordinationSettings::default(),
            create_snapshot_on_exit: false,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json(&raw)?;
        debug!("Loaded keeper config from {}", path.display());
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for role in [
            &self.log_storage_disk,
            &self.latest_log_storage_disk,
            &self.snapshot_storage_disk,
        ] {
            if !self.disks.contains_key(role) {
                return Err(ConfigError::Invalid(format!(
                    "storage role refers to unknown disk {:?}",
                    role
                )));
            }
        }

        if let Some(DiskConfig::ObjectStorage(_)) = self.disks.get(&self.latest_log_storage_disk) {
            debug!("latest log disk is object storage, appends fall back to full writes");
        }

        for (name, disk) in &self.disks {
            if let DiskConfig::ObjectStorage(object) = disk {
                match object.provider {
                    ObjectStorageProvider::AzureBlobStorage | ObjectStorageProvider::S3 => {
                        object
                            .container_name()
                            .map_err(|e| ConfigError::Invalid(format!("disk {}: {}", name, e)))?;
                    }
                    ObjectStorageProvider::LocalFs if object.path.is_none() => {
                        return Err(ConfigError::Invalid(format!(
                            "disk {}: local_fs provider needs a path",
                            name
                        )));
                    }
                    _ => {}
                }
            }
        }

        let settings = &self.coordination_settings;
        if settings.rotate_log_storage_interval == 0 {
            return Err(ConfigError::Invalid(
                "rotate_log_storage_interval must be positive".to_string(),
            ));
        }
        if settings.snapshot_distance == 0 {
            return Err(ConfigError::Invalid(
                "snapshot_distance must be positive".to_string(),
            ));
        }
        if settings.snapshots_to_keep == 0 {
            return Err(ConfigError::Invalid(
                "snapshots_to_keep must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
