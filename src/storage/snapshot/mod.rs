//! Snapshot storage on the snapshot disk.
//!
//! # Layout
//!
//! ```text
//! {disk root}/
//! └── snapshots/
//!     ├── snapshot_{1:020}_{index:020}.bin            # state machine image
//!     └── snapshot_{1:020}_{index:020}.bin.meta.json  # index, term, sha256, size
//! ```
//!
//! The metadata blob is written after the data blob, so a snapshot only
//! becomes visible to [`SnapshotStore::load_latest`] once both are durable.

mod store;


pub use store::{SnapshotMeta, SnapshotStore};
