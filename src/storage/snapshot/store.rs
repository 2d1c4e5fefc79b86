//! Disk-backed snapshot storage.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::message::Snapshot;
use crate::storage::disk::Disk;
use crate::storage::log::naming::{SNAPSHOTS_SUB_PATH, StorageKey, StorageRole, parse_storage_key, segment_key};
use crate::traits::StorageResult;

const META_SUFFIX: &str = ".meta.json";

/// Snapshot metadata stored next to the data blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// SHA256 checksum of the data blob.
    pub checksum: String,
    pub data_size: u64,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
}

/// Snapshots on the snapshot disk.
///
/// Each snapshot is two blobs: the data under its range key and a JSON
/// metadata blob written after it. A snapshot without readable metadata or
/// with a checksum mismatch is skipped when loading.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    disk: Arc<dyn Disk>,
    snapshots_to_keep: usize,
}

impl SnapshotStore {
    pub fn new(disk: Arc<dyn Disk>, snapshots_to_keep: usize) -> Self {
        Self {
            disk,
            snapshots_to_keep: snapshots_to_keep.max(1),
        }
    }

    pub fn disk(&self) -> &Arc<dyn Disk> {
        &self.disk
    }

    fn data_key(index: u64) -> StorageKey {
        segment_key(1, Some(index), StorageRole::Snapshot)
    }

    fn meta_key(index: u64) -> String {
        format!("{}{}", Self::data_key(index), META_SUFFIX)
    }

    pub(crate) fn calculate_checksum(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    /// Persists `snapshot`; durable once this returns.
    pub async fn save(&self, snapshot: &Snapshot) -> StorageResult<SnapshotMeta> {
        if snapshot.last_included_index == 0 {
            return Err(StorageError::Codec(
                "snapshot must cover at least one entry".to_string(),
            ));
        }
        let index = snapshot.last_included_index;
        let meta = SnapshotMeta {
            last_included_index: index,
            last_included_term: snapshot.last_included_term,
            checksum: Self::calculate_checksum(&snapshot.data),
            data_size: snapshot.data.len() as u64,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        let data_key = Self::data_key(index);
        self.disk
            .put(data_key.as_str(), Bytes::from(snapshot.data.clone()))
            .await
            .map_err(|source| StorageError::Write {
                key: data_key.to_string(),
                source,
            })?;

        let meta_json = serde_json::to_vec(&meta).map_err(|e| StorageError::Codec(e.to_string()))?;
        let meta_key = Self::meta_key(index);
        self.disk
            .put(&meta_key, Bytes::from(meta_json))
            .await
            .map_err(|source| StorageError::Write {
                key: meta_key.clone(),
                source,
            })?;

        info!(
            "Saved snapshot at index {} (term {}, {} bytes) to {}",
            index,
            meta.last_included_term,
            meta.data_size,
            self.disk.name()
        );
        Ok(meta)
    }

    /// Indices of stored snapshots, ascending.
    pub async fn list(&self) -> StorageResult<Vec<u64>> {
        let keys = self.disk.list(SNAPSHOTS_SUB_PATH).await?;
        let mut indices: Vec<u64> = keys
            .iter()
            .filter_map(|key| match parse_storage_key(key) {
                Some((StorageRole::Snapshot, range)) => range.last_index,
                _ => None,
            })
            .collect();
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }

    pub async fn load_meta(&self, index: u64) -> StorageResult<SnapshotMeta> {
        let meta_key = Self::meta_key(index);
        let raw = self.disk.get(&meta_key).await.map_err(|e| {
            if e.is_not_found() {
                StorageError::NotFound(meta_key.clone())
            } else {
                StorageError::Disk(e)
            }
        })?;
        serde_json::from_slice(&raw).map_err(|e| {
            warn!("Unreadable snapshot metadata {}: {}", meta_key, e);
            StorageError::SnapshotCorrupted(meta_key.clone())
        })
    }

    /// Loads and verifies the snapshot at `index`.
    pub async fn load(&self, index: u64) -> StorageResult<Snapshot> {
        let meta = self.load_meta(index).await?;
        let data_key = Self::data_key(index);
        let data = self.disk.get(data_key.as_str()).await.map_err(|e| {
            if e.is_not_found() {
                StorageError::NotFound(data_key.to_string())
            } else {
                StorageError::Disk(e)
            }
        })?;

        if data.len() as u64 != meta.data_size || Self::calculate_checksum(&data) != meta.checksum {
            return Err(StorageError::SnapshotCorrupted(data_key.to_string()));
        }

        debug!("Loaded snapshot at index {} from {}", index, self.disk.name());
        Ok(Snapshot {
            last_included_index: meta.last_included_index,
            last_included_term: meta.last_included_term,
            data: data.to_vec(),
        })
    }

    /// Newest snapshot that passes verification, if any.
    pub async fn load_latest(&self) -> StorageResult<Option<Snapshot>> {
        for index in self.list().await?.into_iter().rev() {
            match self.load(index).await {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e @ (StorageError::SnapshotCorrupted(_) | StorageError::NotFound(_))) => {
                    warn!("Skipping snapshot at index {}: {}", index, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Deletes all but the newest `snapshots_to_keep` snapshots.
    pub async fn prune(&self) -> StorageResult<usize> {
        let indices = self.list().await?;
        if indices.len() <= self.snapshots_to_keep {
            return Ok(0);
        }
        let excess = indices.len() - self.snapshots_to_keep;
        for &index in &indices[..excess] {
            // metadata first: a data blob without metadata is never loaded
            self.disk.delete(&Self::meta_key(index)).await?;
            self.disk.delete(Self::data_key(index).as_str()).await?;
            debug!("Removed old snapshot at index {}", index);
        }
        info!(
            "Pruned {} snapshots, keeping {}",
            excess, self.snapshots_to_keep
        );
        Ok(excess)
    }
}
