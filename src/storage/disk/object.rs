use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use tracing::{debug, warn};

use super::{Disk, DiskKind, compose_prefix, normalize_key, normalize_prefix};
use crate::config::{ObjectStorageConfig, ObjectStorageProvider};
use crate::error::DiskError;
use crate::traits::DiskResult;

/// A disk backed by an `object_store` implementation.
///
/// The root prefix (the endpoint sub-path) is prepended to every key by
/// literal concatenation, for listings as well as for single-blob calls.
pub struct ObjectStorageDisk {
    name: String,
    store: Arc<dyn ObjectStore>,
    root_prefix: String,
}

impl fmt::Debug for ObjectStorageDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorageDisk")
            .field("name", &self.name)
            .field("store", &self.store.to_string())
            .field("root_prefix", &self.root_prefix)
            .finish()
    }
}

impl ObjectStorageDisk {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        root_prefix: impl AsRef<str>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            root_prefix: root_prefix.as_ref().trim_matches('/').to_string(),
        }
    }

    pub fn from_config(name: &str, config: &ObjectStorageConfig) -> DiskResult<Self> {
        let store: Arc<dyn ObjectStore> = match config.provider {
            ObjectStorageProvider::AzureBlobStorage => {
                let container = config.container_name()?;
                let mut builder = MicrosoftAzureBuilder::new().with_container_name(container);
                if let Some(ref account) = config.account_name {
                    builder = builder.with_account(account);
                }
                if let Some(ref key) = config.account_key {
                    builder = builder.with_access_key(key);
                }
                if let Some(ref endpoint) = config.endpoint {
                    builder = builder.with_endpoint(endpoint.clone());
                }
                if config.allow_http {
                    builder = builder.with_allow_http(true);
                }
                Arc::new(builder.build()?)
            }
            ObjectStorageProvider::S3 => {
                let bucket = config.container_name()?;
                let mut builder = AmazonS3Builder::new().with_bucket_name(bucket);
                if let Some(ref region) = config.region {
                    builder = builder.with_region(region);
                }
                if let Some(ref endpoint) = config.endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(ref access_key) = config.access_key_id {
                    builder = builder.with_access_key_id(access_key);
                }
                if let Some(ref secret_key) = config.secret_access_key {
                    builder = builder.with_secret_access_key(secret_key);
                }
                if config.allow_http {
                    builder = builder.with_allow_http(true);
                }
                Arc::new(builder.build()?)
            }
            ObjectStorageProvider::LocalFs => {
                let path = config.path.as_ref().ok_or_else(|| {
                    DiskError::Config(format!("disk {}: local_fs provider needs a path", name))
                })?;
                std::fs::create_dir_all(path)?;
                Arc::new(LocalFileSystem::new_with_prefix(path)?)
            }
            ObjectStorageProvider::Memory => Arc::new(InMemory::new()),
        };

        let root_prefix = config.endpoint_subpath.clone().unwrap_or_default();
        Ok(Self::new(name, store, root_prefix))
    }

    fn location(&self, key: &str) -> DiskResult<ObjectPath> {
        let key = normalize_key(key)?;
        let full = compose_prefix(&self.root_prefix, &key);
        ObjectPath::parse(&full).map_err(|e| DiskError::InvalidKey(format!("{}: {}", full, e)))
    }

    /// Strips the root prefix from a listed location; `None` if the
    /// location lies outside the root.
    fn relative_key(&self, location: &str) -> Option<String> {
        if self.root_prefix.is_empty() {
            return Some(location.to_string());
        }
        location
            .strip_prefix(self.root_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
    }

    /// Runs `op`, re-attempting once right away on a transient failure.
    async fn retry_once<T, F, Fut>(&self, op: &str, key: &str, f: F) -> DiskResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DiskResult<T>>,
    {
        match f().await {
            Err(e) if e.is_transient() => {
                warn!(
                    "disk {}: {} {} failed ({}), retrying once",
                    self.name, op, key, e
                );
                f().await
            }
            other => other,
        }
    }
}

#[async_trait]
impl Disk for ObjectStorageDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DiskKind {
        DiskKind::ObjectStorage
    }

    fn root_prefix(&self) -> &str {
        &self.root_prefix
    }

    async fn put(&self, key: &str, data: Bytes) -> DiskResult<()> {
        let location = self.location(key)?;
        debug!("disk {}: put {} ({} bytes)", self.name, location, data.len());
        let store = &self.store;
        let location = &location;
        let data = &data;
        self.retry_once("put", key, || async move {
            store.put(location, data.clone().into()).await?;
            Ok::<_, DiskError>(())
        })
        .await
    }

    async fn get(&self, key: &str) -> DiskResult<Bytes> {
        let location = self.location(key)?;
        let store = &self.store;
        let location = &location;
        let result = self
            .retry_once("get", key, || async move {
                let result = store.get(location).await?;
                Ok::<_, DiskError>(result.bytes().await?)
            })
            .await;
        match result {
            Err(e) if e.is_not_found() => Err(DiskError::NotFound(key.to_string())),
            other => other,
        }
    }

    async fn exists(&self, key: &str) -> DiskResult<bool> {
        let location = self.location(key)?;
        let store = &self.store;
        let location = &location;
        self.retry_once("head", key, || async move {
            match store.head(location).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(DiskError::from(e)),
            }
        })
        .await
    }

    async fn list(&self, prefix: &str) -> DiskResult<Vec<String>> {
        let relative = normalize_prefix(prefix)?;
        let full = compose_prefix(&self.root_prefix, &relative);
        let prefix_path = if full.is_empty() {
            None
        } else {
            Some(
                ObjectPath::parse(&full)
                    .map_err(|e| DiskError::InvalidKey(format!("{}: {}", full, e)))?,
            )
        };
        debug!("disk {}: list {:?}", self.name, full);

        let store = &self.store;
        let prefix_path = &prefix_path;
        let metas = self
            .retry_once("list", &full, || async move {
                let metas: Vec<_> = store.list(prefix_path.as_ref()).try_collect().await?;
                Ok::<_, DiskError>(metas)
            })
            .await?;

        let mut keys = Vec::with_capacity(metas.len());
        for meta in metas {
            let location = meta.location.as_ref();
            match self.relative_key(location) {
                Some(key) => keys.push(key),
                None => warn!(
                    "disk {}: listing returned {} outside root {:?}, ignoring",
                    self.name, location, self.root_prefix
                ),
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> DiskResult<()> {
        let location = self.location(key)?;
        let store = &self.store;
        let location = &location;
        self.retry_once("delete", key, || async move {
            match store.delete(location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(DiskError::from(e)),
            }
        })
        .await
    }
}
