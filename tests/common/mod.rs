//! Shared fixtures: a local hot disk in a temp dir and an in-memory cold
//! disk that both survive simulated restarts.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use keeper_log::KeeperConfig;
use keeper_log::KeeperServer;
use keeper_log::error::DiskError;
use keeper_log::storage::disk::{Disk, DiskKind, DiskRoles, LocalDisk, ObjectStorageDisk};
use keeper_log::traits::{DiskResult, KeeperResult};
use object_store::memory::InMemory;
use parking_lot::Mutex;
use tempfile::TempDir;

pub const COLD_ROOT: &str = "cont/logs";

pub struct TestEnv {
    pub local_dir: TempDir,
    pub cold_store: Arc<InMemory>,
    pub config: KeeperConfig,
}

impl TestEnv {
    /// Rotation every 3 entries, snapshots effectively off.
    pub fn new() -> Self {
        let local_dir = TempDir::new().unwrap();
        let mut config = KeeperConfig::local(local_dir.path());
        let settings = &mut config.coordination_settings;
        settings.rotate_log_storage_interval = 3;
        settings.stale_log_gap = 10;
        settings.reserved_log_items = 5;
        Self {
            local_dir,
            cold_store: Arc::new(InMemory::new()),
            config,
        }
    }

    pub fn local_disk(&self) -> Arc<dyn Disk> {
        Arc::new(LocalDisk::new("local", self.local_dir.path()).unwrap())
    }

    pub fn cold_disk(&self) -> Arc<dyn Disk> {
        Arc::new(ObjectStorageDisk::new(
            "cold",
            self.cold_store.clone(),
            COLD_ROOT,
        ))
    }

    pub fn roles(&self) -> DiskRoles {
        let local = self.local_disk();
        DiskRoles {
            latest_log: local.clone(),
            log: self.cold_disk(),
            snapshot: local,
        }
    }

    /// Starts a server without the background scheduler.
    pub async fn start(&self) -> KeeperServer {
        self.try_start().await.unwrap()
    }

    pub async fn try_start(&self) -> KeeperResult<KeeperServer> {
        KeeperServer::start_with_roles(&self.config, self.roles(), false).await
    }

    /// Starts with the hot disk wrapped in a [`FaultyDisk`].
    pub async fn start_faulty(&self) -> (KeeperServer, Arc<FaultyDisk>) {
        let mut roles = self.roles();
        let faulty = Arc::new(FaultyDisk::new(roles.latest_log.clone()));
        roles.latest_log = faulty.clone();
        let server = KeeperServer::start_with_roles(&self.config, roles, false)
            .await
            .unwrap();
        (server, faulty)
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_puts: Option<(String, usize)>,
    torn_appends: usize,
}

/// Wraps a disk and injects write failures.
#[derive(Debug)]
pub struct FaultyDisk {
    inner: Arc<dyn Disk>,
    faults: Mutex<Faults>,
}

impl FaultyDisk {
    pub fn new(inner: Arc<dyn Disk>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Fails the next `times` puts whose key contains `pattern`.
    pub fn fail_puts(&self, pattern: &str, times: usize) {
        self.faults.lock().failing_puts = Some((pattern.to_string(), times));
    }

    /// The next `times` appends write half their data and fail.
    pub fn tear_appends(&self, times: usize) {
        self.faults.lock().torn_appends = times;
    }

    pub fn heal(&self) {
        *self.faults.lock() = Faults::default();
    }

    fn injected(what: &str) -> DiskError {
        DiskError::Io(std::io::Error::other(format!("injected {} failure", what)))
    }
}

#[async_trait]
impl Disk for FaultyDisk {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> DiskKind {
        self.inner.kind()
    }

    fn root_prefix(&self) -> &str {
        self.inner.root_prefix()
    }

    fn supports_append(&self) -> bool {
        self.inner.supports_append()
    }

    async fn put(&self, key: &str, data: Bytes) -> DiskResult<()> {
        let fail = {
            let mut faults = self.faults.lock();
            match &mut faults.failing_puts {
                Some((pattern, times)) if *times > 0 && key.contains(pattern.as_str()) => {
                    *times -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            return Err(Self::injected("put"));
        }
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> DiskResult<Bytes> {
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> DiskResult<bool> {
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &str) -> DiskResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> DiskResult<()> {
        self.inner.delete(key).await
    }

    async fn append(&self, key: &str, data: Bytes) -> DiskResult<()> {
        let tear = {
            let mut faults = self.faults.lock();
            let tear = faults.torn_appends > 0;
            if tear {
                faults.torn_appends -= 1;
            }
            tear
        };
        if tear {
            self.inner.append(key, data.slice(..data.len() / 2)).await?;
            return Err(Self::injected("append"));
        }
        self.inner.append(key, data).await
    }
}
