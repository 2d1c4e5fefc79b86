//! Tiered log storage.
//!
//! Entries are framed into segments. The active segment lives on the
//! latest-log disk; sealed segments migrate to the log disk. A single writer
//! task owns the segment index.
//!
//! # Module Structure
//!
//! - `naming`: storage keys of segments and snapshots, prefix composition
//! - `entry`: frame header and entry codec
//! - `segment`: segment descriptors and the in-memory active segment
//! - `manager`: rotation, migration, discovery, reads and compaction
//! - `store`: the single writer task and its handle

mod entry;
mod manager;
pub mod naming;
mod segment;
mod store;


pub use entry::{
    ENTRY_MAGIC_NUM, FRAME_HEADER_SIZE, FrameHeader, FrameRead, decode_frame, encode_frame,
};
pub use manager::{
    HIGH_WATER_MARK_KEY, LogStoreStatus, MigrationTask, TieredLogOptions, TieredLogStore,
    verify_contiguous,
};
pub use naming::{IndexRange, StorageKey, StorageRole, compose_prefix, parse_storage_key, segment_key};
pub use segment::{ActiveSegment, DecodedSegment, SegmentDescriptor, SegmentPhase, decode_segment};
pub use store::{LogOp, LogStoreHandle};
