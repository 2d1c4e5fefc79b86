pub mod disk;
pub mod log;
pub mod snapshot;

pub use disk::{Disk, DiskRegistry, DiskRoles, LocalDisk, ObjectStorageDisk};
pub use log::{LogStoreHandle, TieredLogStore};
pub use snapshot::SnapshotStore;
