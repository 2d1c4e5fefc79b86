//! Background rotation of the active segment and migration to cold storage.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::CoordinationSettings;
use crate::storage::log::LogStoreHandle;
use crate::traits::StorageResult;

/// What one scheduler tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub sealed: bool,
    pub migrated: usize,
}

#[derive(Clone)]
pub struct RotationScheduler {
    log: LogStoreHandle,
    period: Duration,
    reserved_log_items: u64,
}

impl RotationScheduler {
    pub fn new(log: LogStoreHandle, settings: &CoordinationSettings) -> Self {
        Self {
            log,
            period: settings.rotation_check_interval(),
            reserved_log_items: settings.reserved_log_items,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Seals the active segment if a rotation trigger fired, then migrates
    /// every eligible sealed segment. Runs to completion.
    pub async fn run_once(&self) -> StorageResult<TickReport> {
        let sealed = self.log.rotate_if_due().await?;
        if let Some(segment) = &sealed {
            debug!("Time-based rotation sealed {}", segment.key);
        }
        let migrated = self.log.migrate_eligible(self.reserved_log_items).await?;
        Ok(TickReport {
            sealed: sealed.is_some(),
            migrated,
        })
    }

    /// Ticks every period until `shutdown` flips to true.
    ///
    /// A tick that already started finishes before the task exits.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Rotation scheduler started, period {:?}", self.period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.run_once().await {
                            Ok(report) if report.migrated > 0 || report.sealed => {
                                debug!("Rotation tick: {:?}", report);
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Rotation tick failed: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Rotation scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use object_store::memory::InMemory;
    use tempfile::TempDir;

    use super::*;
    use crate::message::LogEntry;
    use crate::storage::disk::{Disk, DiskRoles, LocalDisk, ObjectStorageDisk};
    use crate::storage::log::{SegmentPhase, TieredLogOptions, TieredLogStore};

    fn roles(temp_dir: &TempDir) -> DiskRoles {
        let local: Arc<dyn Disk> = Arc::new(LocalDisk::new("local", temp_dir.path()).unwrap());
        DiskRoles {
            latest_log: local.clone(),
            log: Arc::new(ObjectStorageDisk::new("cold", Arc::new(InMemory::new()), "cont/logs")),
            snapshot: local,
        }
    }

    fn settings(reserved: u64) -> CoordinationSettings {
        CoordinationSettings {
            rotate_log_storage_interval: 3,
            reserved_log_items: reserved,
            rotation_check_interval_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_once_migrates_past_reserved_floor() {
        let temp_dir = TempDir::new().unwrap();
        let settings = settings(3);
        let (handle, rx) = LogStoreHandle::new();
        handle.start(
            TieredLogStore::new(roles(&temp_dir), TieredLogOptions::from(&settings)),
            rx,
        );
        for i in 1..=10 {
            handle.append(LogEntry::new(i, 1, vec![1])).await.unwrap();
        }

        let scheduler = RotationScheduler::new(handle.clone(), &settings);
        let report = scheduler.run_once().await.unwrap();
        assert!(!report.sealed);
        // 1..=3 and 4..=6 end at least 3 entries behind index 10
        assert_eq!(report.migrated, 2);

        let again = scheduler.run_once().await.unwrap();
        assert_eq!(again.migrated, 0);

        let status = handle.status().await.unwrap();
        let phases: Vec<_> = status.segments.iter().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![
                SegmentPhase::Migrated,
                SegmentPhase::Migrated,
                SegmentPhase::Sealed,
                SegmentPhase::Open
            ]
        );
    }

    #[tokio::test]
    async fn test_time_based_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let mut settings = settings(100);
        settings.rotate_log_storage_interval = 1000;
        settings.rotate_period_ms = 1;
        let (handle, rx) = LogStoreHandle::new();
        handle.start(
            TieredLogStore::new(roles(&temp_dir), TieredLogOptions::from(&settings)),
            rx,
        );

        let scheduler = RotationScheduler::new(handle.clone(), &settings);
        // nothing to seal yet
        assert!(!scheduler.run_once().await.unwrap().sealed);

        handle.append(LogEntry::new(1, 1, vec![1])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(scheduler.run_once().await.unwrap().sealed);
        assert_eq!(handle.status().await.unwrap().active_first_index, 2);
    }

    #[tokio::test]
    async fn test_spawned_scheduler_stops_on_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let settings = settings(0);
        let (handle, rx) = LogStoreHandle::new();
        handle.start(
            TieredLogStore::new(roles(&temp_dir), TieredLogOptions::from(&settings)),
            rx,
        );
        for i in 1..=6 {
            handle.append(LogEntry::new(i, 1, vec![1])).await.unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = RotationScheduler::new(handle.clone(), &settings).spawn(shutdown_rx);

        let mut migrated = false;
        for _ in 0..100 {
            let status = handle.status().await.unwrap();
            if status.segments[..2]
                .iter()
                .all(|s| s.phase == SegmentPhase::Migrated)
            {
                migrated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(migrated);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
