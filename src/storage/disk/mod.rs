//! Pluggable disks for log segments and snapshots.
//!
//! A [`Disk`] is a flat key/blob store scoped to one root prefix. Keys are
//! always relative to that root; every implementation composes the physical
//! location with [`compose_prefix`] and never lets a key escape the root.
//!
//! Two variants exist:
//!
//! - [`LocalDisk`]: a directory on the local filesystem, supports appends and
//!   is the natural home of the active segment.
//! - [`ObjectStorageDisk`]: any `object_store` backend (Azure Blob, S3, local
//!   filesystem, in-memory) with an optional sub-path used as root prefix.

mod local;
mod object;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::config::DiskConfig;
use crate::error::DiskError;
use crate::traits::DiskResult;

pub use crate::storage::log::naming::compose_prefix;
pub use local::LocalDisk;
pub use object::ObjectStorageDisk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskKind {
    Local,
    ObjectStorage,
}

/// Static description of a configured disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescriptor {
    pub name: String,
    pub kind: DiskKind,
    pub root_prefix: String,
}

#[async_trait]
pub trait Disk: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn kind(&self) -> DiskKind;

    fn root_prefix(&self) -> &str;

    fn descriptor(&self) -> DiskDescriptor {
        DiskDescriptor {
            name: self.name().to_string(),
            kind: self.kind(),
            root_prefix: self.root_prefix().to_string(),
        }
    }

    /// Whether [`Disk::append`] is available.
    fn supports_append(&self) -> bool {
        false
    }

    /// Writes or overwrites `key`; durable when this returns.
    async fn put(&self, key: &str, data: Bytes) -> DiskResult<()>;

    /// Reads `key`, [`DiskError::NotFound`] when absent.
    async fn get(&self, key: &str) -> DiskResult<Bytes>;

    async fn exists(&self, key: &str) -> DiskResult<bool>;

    /// Lists keys under `prefix`, relative to the disk root and sorted.
    ///
    /// Matching is per path segment: `logs` matches `logs/a` but not `logs2/a`.
    /// An empty prefix (or `/`) lists everything under the root.
    async fn list(&self, prefix: &str) -> DiskResult<Vec<String>>;

    /// Removes `key`; removing an absent key succeeds.
    async fn delete(&self, key: &str) -> DiskResult<()>;

    async fn append(&self, _key: &str, _data: Bytes) -> DiskResult<()> {
        Err(DiskError::Unsupported {
            disk: self.name().to_string(),
            op: "append",
        })
    }
}

/// Validates a disk-relative key and strips surrounding separators.
pub(crate) fn normalize_key(key: &str) -> DiskResult<String> {
    let trimmed = key.trim_matches('/');
    if trimmed.is_empty() {
        return Err(DiskError::InvalidKey(key.to_string()));
    }
    for part in trimmed.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
            return Err(DiskError::InvalidKey(key.to_string()));
        }
    }
    Ok(trimmed.to_string())
}

/// Normalizes a listing prefix; empty and `/` both mean "everything".
pub(crate) fn normalize_prefix(prefix: &str) -> DiskResult<String> {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    normalize_key(trimmed)
}

/// Named disks built once at startup.
#[derive(Default, Clone)]
pub struct DiskRegistry {
    disks: HashMap<String, Arc<dyn Disk>>,
}

impl DiskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(disks: &HashMap<String, DiskConfig>) -> DiskResult<Self> {
        let mut registry = Self::new();
        for (name, config) in disks {
            let disk: Arc<dyn Disk> = match config {
                DiskConfig::Local(local) => Arc::new(LocalDisk::new(name, &local.path)?),
                DiskConfig::ObjectStorage(object) => {
                    Arc::new(ObjectStorageDisk::from_config(name, object)?)
                }
            };
            info!(
                "Configured disk {}: kind={:?}, root={:?}",
                name,
                disk.kind(),
                disk.root_prefix()
            );
            registry.register(disk);
        }
        Ok(registry)
    }

    /// Adds or replaces a disk under its own name.
    pub fn register(&mut self, disk: Arc<dyn Disk>) {
        self.disks.insert(disk.name().to_string(), disk);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Disk>> {
        self.disks.get(name).cloned()
    }

    pub fn resolve_roles(
        &self,
        latest_log_disk: &str,
        log_disk: &str,
        snapshot_disk: &str,
    ) -> DiskResult<DiskRoles> {
        let lookup = |name: &str| {
            self.get(name)
                .ok_or_else(|| DiskError::Config(format!("unknown disk {:?}", name)))
        };
        Ok(DiskRoles {
            latest_log: lookup(latest_log_disk)?,
            log: lookup(log_disk)?,
            snapshot: lookup(snapshot_disk)?,
        })
    }
}

/// Disks bound to the three storage roles.
#[derive(Debug, Clone)]
pub struct DiskRoles {
    /// Holds the active segment and recently sealed ones.
    pub latest_log: Arc<dyn Disk>,
    /// Cold tier for rotated segments.
    pub log: Arc<dyn Disk>,
    pub snapshot: Arc<dyn Disk>,
}

impl DiskRoles {
    pub fn single(disk: Arc<dyn Disk>) -> Self {
        Self {
            latest_log: disk.clone(),
            log: disk.clone(),
            snapshot: disk,
        }
    }

    /// True when sealed segments move to a different disk.
    pub fn is_tiered(&self) -> bool {
        self.latest_log.name() != self.log.name()
    }
}
