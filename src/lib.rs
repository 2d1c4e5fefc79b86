//! Keeper log storage: segmented logs tiered across local and object
//! storage disks, snapshots, and crash recovery by replay.

pub mod config;
pub mod error;
pub mod keeper;
pub mod message;
pub mod recovery;
pub mod rotation;
pub mod storage;
pub mod traits;

pub use config::{CoordinationSettings, DiskConfig, KeeperConfig};
pub use error::{ApplyError, ConfigError, DiskError, KeeperError, StorageError};
pub use keeper::{KeeperOp, KeeperServer, KeeperStateMachine};
pub use message::{LogEntry, Snapshot};
pub use recovery::{Readiness, ReadinessGate, RecoveryEngine, RecoveryReport};
pub use rotation::RotationScheduler;
pub use traits::StateMachine;
