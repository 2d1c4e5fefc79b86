use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::message::LogEntry;
use crate::traits::StorageResult;

use super::manager::{LogStoreStatus, MigrationTask, TieredLogStore};
use super::segment::SegmentDescriptor;

const OP_BATCH_SIZE: usize = 64;

/// A mutation or read served by the single writer task.
pub enum LogOp {
    Append {
        entry: LogEntry,
        response_tx: oneshot::Sender<StorageResult<u64>>,
    },
    Rotate {
        response_tx: oneshot::Sender<StorageResult<Option<SegmentDescriptor>>>,
    },
    RotateIfDue {
        response_tx: oneshot::Sender<StorageResult<Option<SegmentDescriptor>>>,
    },
    BeginMigrations {
        reserved_log_items: u64,
        response_tx: oneshot::Sender<StorageResult<Vec<MigrationTask>>>,
    },
    FinishMigration {
        segment_id: u64,
        outcome: StorageResult<()>,
        response_tx: oneshot::Sender<StorageResult<()>>,
    },
    Read {
        low: u64,
        high: u64,
        response_tx: oneshot::Sender<StorageResult<Vec<LogEntry>>>,
    },
    Compact {
        up_to_index: u64,
        response_tx: oneshot::Sender<StorageResult<usize>>,
    },
    Status {
        response_tx: oneshot::Sender<LogStoreStatus>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Cloneable front of the single writer task owning a [`TieredLogStore`].
#[derive(Clone)]
pub struct LogStoreHandle {
    op_sender: mpsc::UnboundedSender<LogOp>,
}

impl LogStoreHandle {
    /// Creates the handle along with the receiver to pass to [`LogStoreHandle::start`].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogOp>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { op_sender: tx }, rx)
    }

    /// Spawns the writer task; operations are served strictly in arrival order.
    pub fn start(
        &self,
        mut store: TieredLogStore,
        mut receiver: mpsc::UnboundedReceiver<LogOp>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let mut buf = Vec::with_capacity(OP_BATCH_SIZE);
                let size = receiver.recv_many(&mut buf, OP_BATCH_SIZE).await;
                if size == 0 {
                    warn!("Log store receiver closed");
                    break;
                }

                for op in buf {
                    if let Some(done) = Self::process(&mut store, op).await {
                        info!("Log store stopped at index {}", store.last_index());
                        let _ = done.send(());
                        return;
                    }
                }
            }
        })
    }

    async fn process(store: &mut TieredLogStore, op: LogOp) -> Option<oneshot::Sender<()>> {
        match op {
            LogOp::Append { entry, response_tx } => {
                let _ = response_tx.send(store.append(entry).await);
            }
            LogOp::Rotate { response_tx } => {
                let _ = response_tx.send(store.seal_and_rotate().await);
            }
            LogOp::RotateIfDue { response_tx } => {
                let _ = response_tx.send(store.rotate_if_due().await);
            }
            LogOp::BeginMigrations {
                reserved_log_items,
                response_tx,
            } => {
                let mut tasks = Vec::new();
                let mut result = Ok(());
                for id in store.migration_candidates(reserved_log_items) {
                    match store.begin_migration(id) {
                        Ok(Some(task)) => tasks.push(task),
                        Ok(None) => {}
                        Err(e) => {
                            result = Err(e);
                            break;
                        }
                    }
                }
                let _ = response_tx.send(result.map(|_| tasks));
            }
            LogOp::FinishMigration {
                segment_id,
                outcome,
                response_tx,
            } => {
                let _ = response_tx.send(store.finish_migration(segment_id, outcome).await);
            }
            LogOp::Read {
                low,
                high,
                response_tx,
            } => {
                let _ = response_tx.send(store.read_entries(low, high).await);
            }
            LogOp::Compact {
                up_to_index,
                response_tx,
            } => {
                let _ = response_tx.send(store.compact(up_to_index).await);
            }
            LogOp::Status { response_tx } => {
                let _ = response_tx.send(store.status());
            }
            LogOp::Shutdown { response_tx } => return Some(response_tx),
        }
        None
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> LogOp,
    ) -> StorageResult<T> {
        let (tx, rx) = oneshot::channel();
        self.op_sender
            .send(build(tx))
            .map_err(|_| StorageError::ChannelClosed)?;
        rx.await.map_err(|_| StorageError::ChannelClosed)
    }

    pub async fn append(&self, entry: LogEntry) -> StorageResult<u64> {
        self.request(|response_tx| LogOp::Append { entry, response_tx })
            .await?
    }

    pub async fn seal_and_rotate(&self) -> StorageResult<Option<SegmentDescriptor>> {
        self.request(|response_tx| LogOp::Rotate { response_tx })
            .await?
    }

    pub async fn rotate_if_due(&self) -> StorageResult<Option<SegmentDescriptor>> {
        self.request(|response_tx| LogOp::RotateIfDue { response_tx })
            .await?
    }

    /// Migrates every eligible sealed segment and waits for all of them.
    ///
    /// Copies run on this task, outside the writer queue; appends keep
    /// flowing meanwhile. Returns how many segments moved.
    pub async fn migrate_eligible(&self, reserved_log_items: u64) -> StorageResult<usize> {
        let tasks = self
            .request(|response_tx| LogOp::BeginMigrations {
                reserved_log_items,
                response_tx,
            })
            .await??;

        let mut migrated = 0;
        let mut first_error = None;
        for task in tasks {
            let segment_id = task.segment_id();
            let outcome = task.run().await;
            let finished = self
                .request(|response_tx| LogOp::FinishMigration {
                    segment_id,
                    outcome,
                    response_tx,
                })
                .await?;
            match finished {
                Ok(()) => migrated += 1,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                if migrated > 0 {
                    debug!("Migrated {} segments", migrated);
                }
                Ok(migrated)
            }
        }
    }

    /// Entries with index in `[low, high)`.
    pub async fn read_entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>> {
        self.request(|response_tx| LogOp::Read {
            low,
            high,
            response_tx,
        })
        .await?
    }

    pub async fn compact(&self, up_to_index: u64) -> StorageResult<usize> {
        self.request(|response_tx| LogOp::Compact {
            up_to_index,
            response_tx,
        })
        .await?
    }

    pub async fn status(&self) -> StorageResult<LogStoreStatus> {
        self.request(|response_tx| LogOp::Status { response_tx })
            .await
    }

    pub async fn last_index(&self) -> StorageResult<u64> {
        Ok(self.status().await?.last_index)
    }

    /// Stops the writer task after everything queued before this call.
    pub async fn shutdown(&self) -> StorageResult<()> {
        self.request(|response_tx| LogOp::Shutdown { response_tx })
            .await
    }
}
