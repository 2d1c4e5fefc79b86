use async_trait::async_trait;

use crate::error::{ApplyError, DiskError, KeeperError, StorageError};
use crate::message::{LogEntry, Snapshot};

pub type DiskResult<T> = Result<T, DiskError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type ApplyResult<T> = Result<T, ApplyError>;
pub type KeeperResult<T> = Result<T, KeeperError>;

/// The apply path fed by recovery and by the live command path.
///
/// Entries arrive in strict index order. Implementations track the last
/// applied index themselves so that a snapshot can be cut at any point.
#[async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply(&self, entry: &LogEntry) -> ApplyResult<()>;

    /// Last applied `(index, term)`, `(0, 0)` before anything was applied.
    fn last_applied(&self) -> (u64, u64);

    async fn create_snapshot(&self) -> StorageResult<Snapshot>;

    async fn restore_snapshot(&self, snapshot: &Snapshot) -> ApplyResult<()>;
}
