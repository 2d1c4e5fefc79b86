//! Startup recovery: snapshot restore, segment discovery and replay.
//!
//! Recovery runs once, before the log writer task starts, and reports its
//! progress through a [`ReadinessGate`] that the command path consults.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{KeeperError, StorageError};
use crate::storage::log::{ActiveSegment, DecodedSegment, SegmentDescriptor, TieredLogStore};
use crate::storage::snapshot::SnapshotStore;
use crate::traits::{KeeperResult, StateMachine, StorageResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    NotReady,
    Replaying,
    Ready,
    Failed(String),
}

/// Shared readiness state; commands are refused until it reads `Ready`.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    tx: Arc<watch::Sender<Readiness>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Readiness::NotReady);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, readiness: Readiness) {
        debug!("Readiness -> {:?}", readiness);
        self.tx.send_replace(readiness);
    }

    pub fn current(&self) -> Readiness {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Readiness> {
        self.tx.subscribe()
    }

    pub fn check(&self) -> KeeperResult<()> {
        match *self.tx.borrow() {
            Readiness::Ready => Ok(()),
            _ => Err(KeeperError::NotReady),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `0` when no snapshot was restored.
    pub snapshot_index: u64,
    pub segments: usize,
    pub replayed: u64,
    pub last_index: u64,
    pub last_term: u64,
}

pub struct RecoveryEngine {
    store: TieredLogStore,
    snapshots: SnapshotStore,
    state_machine: Arc<dyn StateMachine>,
    gate: ReadinessGate,
}

impl RecoveryEngine {
    pub fn new(
        store: TieredLogStore,
        snapshots: SnapshotStore,
        state_machine: Arc<dyn StateMachine>,
        gate: ReadinessGate,
    ) -> Self {
        Self {
            store,
            snapshots,
            state_machine,
            gate,
        }
    }

    /// Rebuilds the state machine and the segment index.
    ///
    /// On success the store is handed back, ready for the writer task, and
    /// the gate reads `Ready`. Any failure leaves the gate at `Failed`.
    pub async fn run(mut self) -> StorageResult<(TieredLogStore, RecoveryReport)> {
        self.gate.set(Readiness::Replaying);
        match self.replay().await {
            Ok(report) => {
                info!(
                    "Recovery complete: snapshot {}, {} segments, {} entries replayed, last index {}",
                    report.snapshot_index, report.segments, report.replayed, report.last_index
                );
                self.gate.set(Readiness::Ready);
                Ok((self.store, report))
            }
            Err(e) => {
                error!("Recovery failed: {}", e);
                self.gate.set(Readiness::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn replay(&mut self) -> StorageResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        // 1. latest valid snapshot
        if let Some(snapshot) = self.snapshots.load_latest().await? {
            self.state_machine.restore_snapshot(&snapshot).await?;
            report.snapshot_index = snapshot.last_included_index;
            report.last_term = snapshot.last_included_term;
            info!(
                "Restored snapshot at index {} (term {})",
                snapshot.last_included_index, snapshot.last_included_term
            );
        }
        let snapshot_index = report.snapshot_index;

        // 2. every segment on both tiers
        let segments = self.store.discover().await?;
        report.segments = segments.len();

        // 3. segments wholly behind the snapshot are kept but not read
        let (sealed, open): (Vec<SegmentDescriptor>, Vec<SegmentDescriptor>) =
            segments.into_iter().partition(|s| !s.is_open());
        let open = open.into_iter().next();
        let pending: Vec<&SegmentDescriptor> = sealed
            .iter()
            .chain(open.iter())
            .filter(|s| s.last_index.is_none_or(|last| last > snapshot_index))
            .collect();

        // 4. strict index order from snapshot_index + 1
        let mut next = snapshot_index + 1;
        if let Some(first) = pending.first() {
            if first.first_index > next {
                return Err(StorageError::ReplayGap {
                    expected: next,
                    found: first.first_index,
                });
            }
        }

        let mut active = None;
        for segment in pending {
            let (decoded, data) = self.store.load_segment(segment).await?;
            debug!(
                "Replaying {} from {} ({} entries)",
                segment.key,
                segment.disk_id,
                decoded.entries.len()
            );

            for entry in &decoded.entries {
                if entry.index < next {
                    continue;
                }
                if entry.index != next {
                    return Err(StorageError::ReplayGap {
                        expected: next,
                        found: entry.index,
                    });
                }
                self.state_machine.apply(entry).await?;
                report.last_term = entry.term;
                report.replayed += 1;
                next += 1;
            }

            if segment.is_open() {
                active = Some(self.adopt_open(segment, decoded, data).await?);
            }
        }

        let last_index = next - 1;
        report.last_index = last_index;

        let high_water_mark = self.store.read_high_water_mark().await?;
        if high_water_mark > last_index {
            return Err(StorageError::CorruptLog(format!(
                "log ends at index {} but index {} was sealed before",
                last_index, high_water_mark
            )));
        }

        // 5. continue in the open tail or start a fresh active segment
        let active = match active {
            Some(active)
                if active
                    .last_index()
                    .unwrap_or(active.first_index().saturating_sub(1))
                    == last_index =>
            {
                active
            }
            Some(stale) => {
                warn!(
                    "Open segment {} ends behind snapshot index {}, starting a new one",
                    stale.key(),
                    snapshot_index
                );
                self.store
                    .roles()
                    .latest_log
                    .delete(stale.key().as_str())
                    .await?;
                ActiveSegment::new(last_index + 1)
            }
            None => ActiveSegment::new(last_index + 1),
        };

        self.store
            .install(sealed, active, report.last_term, high_water_mark);
        Ok(report)
    }

    /// Turns the open tail into the active segment, cutting a torn tail.
    async fn adopt_open(
        &self,
        segment: &SegmentDescriptor,
        decoded: DecodedSegment,
        data: Bytes,
    ) -> StorageResult<ActiveSegment> {
        let truncated = decoded.truncated;
        let active = ActiveSegment::from_decoded(segment.first_index, decoded, &data);
        if truncated {
            let disk = &self.store.roles().latest_log;
            disk.put(segment.key.as_str(), Bytes::copy_from_slice(&active.buffer))
                .await
                .map_err(|source| StorageError::Write {
                    key: segment.key.to_string(),
                    source,
                })?;
            info!(
                "Rewrote {} with {} intact entries",
                segment.key,
                active.len()
            );
        }
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    use super::*;
    use crate::error::ApplyError;
    use crate::message::{LogEntry, Snapshot};
    use crate::storage::disk::{Disk, DiskRoles, LocalDisk};
    use crate::storage::log::TieredLogOptions;
    use crate::storage::log::naming::{StorageRole, segment_key};
    use crate::traits::ApplyResult;

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<u64>>,
        last: Mutex<(u64, u64)>,
    }

    #[async_trait]
    impl StateMachine for Recorder {
        async fn apply(&self, entry: &LogEntry) -> ApplyResult<()> {
            let mut last = self.last.lock();
            if entry.index != last.0 + 1 {
                return Err(ApplyError::OutOfOrder {
                    index: entry.index,
                    expected: last.0 + 1,
                });
            }
            *last = (entry.index, entry.term);
            self.applied.lock().push(entry.index);
            Ok(())
        }

        fn last_applied(&self) -> (u64, u64) {
            *self.last.lock()
        }

        async fn create_snapshot(&self) -> StorageResult<Snapshot> {
            let (index, term) = *self.last.lock();
            Ok(Snapshot {
                last_included_index: index,
                last_included_term: term,
                data: index.to_le_bytes().to_vec(),
            })
        }

        async fn restore_snapshot(&self, snapshot: &Snapshot) -> ApplyResult<()> {
            *self.last.lock() = (snapshot.last_included_index, snapshot.last_included_term);
            Ok(())
        }
    }

    fn roles(temp_dir: &TempDir) -> DiskRoles {
        let disk: Arc<dyn Disk> = Arc::new(LocalDisk::new("local", temp_dir.path()).unwrap());
        DiskRoles::single(disk)
    }

    fn options() -> TieredLogOptions {
        TieredLogOptions {
            rotate_interval: 4,
            ..Default::default()
        }
    }

    async fn write_entries(temp_dir: &TempDir, count: u64) {
        let mut store = TieredLogStore::new(roles(temp_dir), options());
        for i in 1..=count {
            store.append(LogEntry::new(i, 1, vec![i as u8])).await.unwrap();
        }
    }

    async fn recover(
        temp_dir: &TempDir,
        sm: Arc<Recorder>,
        gate: ReadinessGate,
    ) -> StorageResult<(TieredLogStore, RecoveryReport)> {
        let roles = roles(temp_dir);
        let snapshots = SnapshotStore::new(roles.snapshot.clone(), 3);
        RecoveryEngine::new(TieredLogStore::new(roles, options()), snapshots, sm, gate)
            .run()
            .await
    }

    #[test]
    fn test_gate_transitions() {
        let gate = ReadinessGate::new();
        let rx = gate.subscribe();
        assert!(matches!(gate.check(), Err(KeeperError::NotReady)));
        gate.set(Readiness::Replaying);
        assert!(gate.check().is_err());
        gate.set(Readiness::Ready);
        assert!(gate.check().is_ok());
        assert_eq!(*rx.borrow(), Readiness::Ready);
    }

    #[tokio::test]
    async fn test_empty_store_is_ready() {
        let temp_dir = TempDir::new().unwrap();
        let gate = ReadinessGate::new();
        let (store, report) = recover(&temp_dir, Arc::new(Recorder::default()), gate.clone())
            .await
            .unwrap();
        assert_eq!(report, RecoveryReport::default());
        assert_eq!(store.last_index(), 0);
        assert_eq!(gate.current(), Readiness::Ready);
    }

    #[tokio::test]
    async fn test_replays_every_entry_in_order() {
        let temp_dir = TempDir::new().unwrap();
        write_entries(&temp_dir, 10).await;

        let sm = Arc::new(Recorder::default());
        let (mut store, report) = recover(&temp_dir, sm.clone(), ReadinessGate::new())
            .await
            .unwrap();
        assert_eq!(*sm.applied.lock(), (1..=10).collect::<Vec<_>>());
        assert_eq!(report.replayed, 10);
        assert_eq!(report.last_index, 10);
        assert_eq!(report.segments, 3);

        // the open tail 9..=10 is continued
        store.append(LogEntry::new(11, 1, vec![11])).await.unwrap();
        assert_eq!(store.last_index(), 11);
    }

    #[tokio::test]
    async fn test_snapshot_skips_covered_entries() {
        let temp_dir = TempDir::new().unwrap();
        write_entries(&temp_dir, 10).await;
        let snapshots = SnapshotStore::new(roles(&temp_dir).snapshot, 3);
        snapshots
            .save(&Snapshot {
                last_included_index: 6,
                last_included_term: 1,
                data: vec![6],
            })
            .await
            .unwrap();

        let sm = Arc::new(Recorder::default());
        let (_, report) = recover(&temp_dir, sm.clone(), ReadinessGate::new())
            .await
            .unwrap();
        assert_eq!(report.snapshot_index, 6);
        assert_eq!(*sm.applied.lock(), vec![7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_missing_segment_fails_recovery() {
        let temp_dir = TempDir::new().unwrap();
        write_entries(&temp_dir, 10).await;
        let disk = roles(&temp_dir).latest_log;
        let first = segment_key(1, Some(4), StorageRole::Log);
        assert!(disk.exists(first.as_str()).await.unwrap());
        disk.delete(first.as_str()).await.unwrap();

        let gate = ReadinessGate::new();
        let result = recover(&temp_dir, Arc::new(Recorder::default()), gate.clone()).await;
        assert!(matches!(
            result,
            Err(StorageError::ReplayGap { expected: 1, found: 5 })
        ));
        assert!(matches!(gate.current(), Readiness::Failed(_)));
    }
}
