//! A single keeper node: recovery, the write path and background storage tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{CoordinationSettings, KeeperConfig};
use crate::error::{KeeperError, StorageError};
use crate::message::LogEntry;
use crate::recovery::{Readiness, ReadinessGate, RecoveryEngine, RecoveryReport};
use crate::rotation::{RotationScheduler, TickReport};
use crate::storage::disk::{DiskRegistry, DiskRoles};
use crate::storage::log::{LogStoreHandle, LogStoreStatus, TieredLogOptions, TieredLogStore};
use crate::storage::snapshot::SnapshotStore;
use crate::traits::{KeeperResult, StateMachine, StorageResult};

use super::operation::{KeeperOp, OpResult};
use super::state_machine::{KeeperStateMachine, Stat};

const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(20);

struct SchedulerTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct KeeperServer {
    server_id: u64,
    settings: CoordinationSettings,
    create_snapshot_on_exit: bool,
    term: u64,
    log: LogStoreHandle,
    log_task: Mutex<Option<JoinHandle<()>>>,
    scheduler: RotationScheduler,
    scheduler_task: Mutex<Option<SchedulerTask>>,
    state_machine: Arc<KeeperStateMachine>,
    snapshots: SnapshotStore,
    gate: ReadinessGate,
    /// Serializes validate, append and apply.
    write_lock: tokio::sync::Mutex<()>,
    last_snapshot_index: AtomicU64,
    recovery: RecoveryReport,
}

impl KeeperServer {
    /// Builds the configured disks, recovers and starts serving.
    pub async fn start(config: KeeperConfig) -> KeeperResult<Self> {
        config
            .validate()
            .map_err(|e| KeeperError::BadArguments(e.to_string()))?;
        let registry = DiskRegistry::from_config(&config.disks).map_err(StorageError::from)?;
        let roles = registry
            .resolve_roles(
                &config.latest_log_storage_disk,
                &config.log_storage_disk,
                &config.snapshot_storage_disk,
            )
            .map_err(StorageError::from)?;
        Self::start_with_roles(&config, roles, true).await
    }

    /// Starts on already built disks. The rotation scheduler is spawned only
    /// when `spawn_scheduler` is set; otherwise call [`KeeperServer::run_maintenance`].
    pub async fn start_with_roles(
        config: &KeeperConfig,
        roles: DiskRoles,
        spawn_scheduler: bool,
    ) -> KeeperResult<Self> {
        let settings = config.coordination_settings.clone();
        info!(
            "Starting keeper server {} (latest log: {}, log: {}, snapshots: {})",
            config.server_id,
            roles.latest_log.name(),
            roles.log.name(),
            roles.snapshot.name()
        );

        let gate = ReadinessGate::new();
        let state_machine = Arc::new(KeeperStateMachine::new());
        let snapshots = SnapshotStore::new(roles.snapshot.clone(), settings.snapshots_to_keep);
        let store = TieredLogStore::new(roles, TieredLogOptions::from(&settings));

        let engine = RecoveryEngine::new(
            store,
            snapshots.clone(),
            state_machine.clone() as Arc<dyn StateMachine>,
            gate.clone(),
        );
        let (store, recovery) = engine.run().await?;

        let (log, rx) = LogStoreHandle::new();
        let log_task = log.start(store, rx);

        let scheduler = RotationScheduler::new(log.clone(), &settings);
        let scheduler_task = spawn_scheduler.then(|| {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            SchedulerTask {
                shutdown_tx,
                handle: scheduler.clone().spawn(shutdown_rx),
            }
        });

        Ok(Self {
            server_id: config.server_id,
            create_snapshot_on_exit: config.create_snapshot_on_exit,
            term: recovery.last_term.max(1),
            log,
            log_task: Mutex::new(Some(log_task)),
            scheduler,
            scheduler_task: Mutex::new(scheduler_task),
            state_machine,
            snapshots,
            gate,
            write_lock: tokio::sync::Mutex::new(()),
            last_snapshot_index: AtomicU64::new(recovery.snapshot_index),
            recovery,
            settings,
        })
    }

    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    pub fn readiness(&self) -> Readiness {
        self.gate.current()
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn last_applied_index(&self) -> u64 {
        self.state_machine.last_applied().0
    }

    pub fn last_snapshot_index(&self) -> u64 {
        self.last_snapshot_index.load(Ordering::Acquire)
    }

    pub async fn log_status(&self) -> KeeperResult<LogStoreStatus> {
        Ok(self.log.status().await?)
    }

    /// Logged entries with index in `[low, high)`.
    pub async fn read_log(&self, low: u64, high: u64) -> KeeperResult<Vec<LogEntry>> {
        Ok(self.log.read_entries(low, high).await?)
    }

    pub async fn create(&self, path: &str, data: impl Into<Vec<u8>>) -> KeeperResult<String> {
        let op = KeeperOp::Create {
            path: path.to_string(),
            data: data.into(),
        };
        match self.submit(op).await? {
            OpResult::Created(path) => Ok(path),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set(&self, path: &str, data: impl Into<Vec<u8>>, version: i32) -> KeeperResult<Stat> {
        let op = KeeperOp::Set {
            path: path.to_string(),
            data: data.into(),
            expected_version: version,
        };
        match self.submit(op).await? {
            OpResult::Set(stat) => Ok(stat),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete(&self, path: &str, version: i32) -> KeeperResult<()> {
        let op = KeeperOp::Delete {
            path: path.to_string(),
            expected_version: version,
        };
        self.submit(op).await.map(|_| ())
    }

    pub fn get(&self, path: &str) -> KeeperResult<(Vec<u8>, Stat)> {
        self.gate.check()?;
        self.state_machine.get(path)
    }

    pub fn exists(&self, path: &str) -> KeeperResult<Option<Stat>> {
        self.gate.check()?;
        self.state_machine.exists(path)
    }

    pub fn get_children(&self, path: &str) -> KeeperResult<Vec<String>> {
        self.gate.check()?;
        self.state_machine.get_children(path)
    }

    /// Validates, logs and applies one mutation.
    ///
    /// The op is checked against the current tree before it reaches the log,
    /// so a logged op always applies. Snapshots are taken on the write path
    /// once `snapshot_distance` entries accumulated.
    pub async fn submit(&self, op: KeeperOp) -> KeeperResult<OpResult> {
        self.gate.check()?;
        let _guard = self.write_lock.lock().await;
        let last_index = self.catch_up().await?;
        self.state_machine.validate(&op)?;
        debug!("Submitting write to {} at index {}", op.path(), last_index + 1);

        let payload = op
            .serialize()
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        let entry = LogEntry::new(last_index + 1, self.term, payload);
        let index = self.append_with_retries(entry.clone()).await?;

        let result = self.state_machine.apply_entry(&entry)?;
        debug!("Committed {:?} at index {}", result, index);

        if index.saturating_sub(self.last_snapshot_index()) >= self.settings.snapshot_distance {
            if let Err(e) = self.snapshot_locked().await {
                warn!("Snapshot at index {} failed: {}", index, e);
            }
        }
        Ok(result)
    }

    /// Applies logged entries the state machine has not seen yet and
    /// returns the last logged index.
    async fn catch_up(&self) -> KeeperResult<u64> {
        let last_index = self.log.last_index().await?;
        let applied = self.state_machine.last_applied().0;
        if last_index > applied {
            warn!(
                "Log ends at {} but state machine is at {}, applying the tail",
                last_index, applied
            );
            for entry in self.log.read_entries(applied + 1, last_index + 1).await? {
                self.state_machine.apply(&entry).await?;
            }
        }
        Ok(last_index)
    }

    /// Appends `entry`, re-attempting `Write` failures.
    ///
    /// Each attempt runs until the writer task answers, so an append is never
    /// left behind in the queue. `operation_timeout` bounds the retries.
    async fn append_with_retries(&self, entry: LogEntry) -> StorageResult<u64> {
        let deadline = Instant::now() + self.settings.operation_timeout();
        let mut attempt = 0;
        loop {
            match self.log.append(entry.clone()).await {
                Ok(index) => return Ok(index),
                Err(e @ StorageError::Write { .. })
                    if attempt < self.settings.write_retries && Instant::now() < deadline =>
                {
                    attempt += 1;
                    warn!(
                        "Append of index {} failed (attempt {}/{}): {}",
                        entry.index, attempt, self.settings.write_retries, e
                    );
                    tokio::time::sleep(WRITE_RETRY_BACKOFF * attempt).await;
                }
                Err(e) => {
                    error!("Append of index {} failed: {}", entry.index, e);
                    return Err(e);
                }
            }
        }
    }

    /// Snapshots the current tree, compacts the log behind it and prunes
    /// old snapshots. Returns the snapshot index.
    pub async fn create_snapshot(&self) -> KeeperResult<u64> {
        self.gate.check()?;
        let _guard = self.write_lock.lock().await;
        Ok(self.snapshot_locked().await?)
    }

    async fn snapshot_locked(&self) -> StorageResult<u64> {
        let snapshot = self.state_machine.create_snapshot().await?;
        let index = snapshot.last_included_index;
        if index <= self.last_snapshot_index() {
            debug!("Snapshot at index {} already exists", index);
            return Ok(index);
        }
        self.snapshots.save(&snapshot).await?;
        self.last_snapshot_index.store(index, Ordering::Release);

        let compact_to = index.saturating_sub(self.settings.reserved_log_items);
        if compact_to > 0 {
            let removed = self.log.compact(compact_to).await?;
            debug!("Compaction up to {} removed {} segments", compact_to, removed);
        }
        self.snapshots.prune().await?;
        Ok(index)
    }

    /// One rotation and migration round, as the background scheduler runs it.
    pub async fn run_maintenance(&self) -> KeeperResult<TickReport> {
        Ok(self.scheduler.run_once().await?)
    }

    /// Stops background work, optionally snapshots, and stops the log writer.
    pub async fn shutdown(&self) -> KeeperResult<()> {
        info!("Shutting down keeper server {}", self.server_id);
        let scheduler_task = self.scheduler_task.lock().take();
        if let Some(task) = scheduler_task {
            let _ = task.shutdown_tx.send(true);
            if let Err(e) = task.handle.await {
                warn!("Rotation scheduler ended abnormally: {}", e);
            }
        }

        if self.create_snapshot_on_exit && self.gate.check().is_ok() {
            let _guard = self.write_lock.lock().await;
            if self.state_machine.last_applied().0 > self.last_snapshot_index() {
                self.snapshot_locked().await?;
            }
        }
        self.gate.set(Readiness::NotReady);

        let log_task = self.log_task.lock().take();
        if let Some(task) = log_task {
            self.log.shutdown().await?;
            if let Err(e) = task.await {
                warn!("Log store task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

fn unexpected(result: OpResult) -> KeeperError {
    KeeperError::BadArguments(format!("unexpected op result {:?}", result))
}
