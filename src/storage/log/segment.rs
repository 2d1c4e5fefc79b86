use std::time::Instant;

use tracing::warn;

use crate::error::StorageError;
use crate::message::LogEntry;
use crate::traits::StorageResult;

use super::entry::{FrameRead, decode_frame};
use super::naming::{IndexRange, StorageKey, StorageRole, segment_key};

/// Lifecycle of a segment, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentPhase {
    Open,
    Sealing,
    Sealed,
    Migrating,
    Migrated,
}

/// Index entry for one segment blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Equal to `first_index`; segments never overlap.
    pub id: u64,
    pub first_index: u64,
    /// Inclusive; `None` while the segment is open.
    pub last_index: Option<u64>,
    /// Name of the disk currently holding the blob.
    pub disk_id: String,
    pub key: StorageKey,
    pub phase: SegmentPhase,
}

impl SegmentDescriptor {
    pub fn sealed(first_index: u64, last_index: u64, disk_id: impl Into<String>) -> Self {
        Self {
            id: first_index,
            first_index,
            last_index: Some(last_index),
            disk_id: disk_id.into(),
            key: segment_key(first_index, Some(last_index), StorageRole::Log),
            phase: SegmentPhase::Sealed,
        }
    }

    pub fn open(first_index: u64, disk_id: impl Into<String>) -> Self {
        Self {
            id: first_index,
            first_index,
            last_index: None,
            disk_id: disk_id.into(),
            key: segment_key(first_index, None, StorageRole::Log),
            phase: SegmentPhase::Open,
        }
    }

    pub fn from_range(range: IndexRange, disk_id: impl Into<String>) -> Self {
        match range.last_index {
            Some(last) => Self::sealed(range.first_index, last, disk_id),
            None => Self::open(range.first_index, disk_id),
        }
    }

    pub fn range(&self) -> IndexRange {
        IndexRange {
            first_index: self.first_index,
            last_index: self.last_index,
        }
    }

    pub fn is_open(&self) -> bool {
        self.last_index.is_none()
    }

    pub fn entry_count(&self) -> u64 {
        self.last_index
            .map(|last| last - self.first_index + 1)
            .unwrap_or(0)
    }

    /// Whether any index of `[low, high)` falls in this segment.
    pub fn overlaps(&self, low: u64, high: u64) -> bool {
        let last = self.last_index.unwrap_or(u64::MAX);
        low <= last && high > self.first_index
    }
}

/// The writable tail of the log, mirrored in memory.
///
/// `buffer` holds exactly the bytes of the open blob so that a failed
/// append can be repaired with a single full write.
#[derive(Debug)]
pub struct ActiveSegment {
    pub(crate) first_index: u64,
    pub(crate) entries: Vec<LogEntry>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) phase: SegmentPhase,
    pub(crate) opened_at: Instant,
}

impl ActiveSegment {
    pub fn new(first_index: u64) -> Self {
        Self {
            first_index,
            entries: Vec::new(),
            buffer: Vec::new(),
            phase: SegmentPhase::Open,
            opened_at: Instant::now(),
        }
    }

    /// Rebuilds the active segment from the verified prefix of an open blob.
    pub fn from_decoded(first_index: u64, decoded: DecodedSegment, data: &[u8]) -> Self {
        let mut active = Self::new(first_index);
        active.buffer = data[..decoded.valid_len].to_vec();
        active.entries = decoded.entries;
        active
    }

    pub fn key(&self) -> StorageKey {
        segment_key(self.first_index, None, StorageRole::Log)
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn last_index(&self) -> Option<u64> {
        self.entries.last().map(|e| e.index)
    }

    pub fn last_term(&self) -> Option<u64> {
        self.entries.last().map(|e| e.term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub(crate) fn push(&mut self, entry: LogEntry, frame: &[u8]) {
        self.buffer.extend_from_slice(frame);
        self.entries.push(entry);
    }

    /// Entries with index in `[low, high)`.
    pub fn slice(&self, low: u64, high: u64) -> &[LogEntry] {
        let start = low.saturating_sub(self.first_index) as usize;
        let end = high.saturating_sub(self.first_index) as usize;
        let start = start.min(self.entries.len());
        let end = end.clamp(start, self.entries.len());
        &self.entries[start..end]
    }
}

#[derive(Debug, Default)]
pub struct DecodedSegment {
    pub entries: Vec<LogEntry>,
    /// Length of the verified prefix of the blob.
    pub valid_len: usize,
    /// Bytes after `valid_len` were dropped.
    pub truncated: bool,
}

/// Decodes every frame of a segment blob.
///
/// For the open segment a torn or corrupt tail is cut off with a warning;
/// the entries before it are still valid. In a sealed segment any bad frame
/// is fatal. Indices inside a blob must be consecutive in both cases.
pub fn decode_segment(key: &StorageKey, data: &[u8], open: bool) -> StorageResult<DecodedSegment> {
    let mut decoded = DecodedSegment::default();
    let mut offset = 0;

    while offset < data.len() {
        match decode_frame(&data[offset..]) {
            FrameRead::Entry(entry, consumed) => {
                if let Some(prev) = decoded.entries.last() {
                    if entry.index != prev.index + 1 {
                        return Err(StorageError::CorruptLog(format!(
                            "{}: index {} follows {}",
                            key, entry.index, prev.index
                        )));
                    }
                }
                decoded.entries.push(entry);
                offset += consumed;
            }
            FrameRead::Torn | FrameRead::Corrupt(_) if open => {
                warn!(
                    "Truncating torn tail of {} at offset {} ({} bytes dropped)",
                    key,
                    offset,
                    data.len() - offset
                );
                decoded.truncated = true;
                break;
            }
            FrameRead::Torn => {
                return Err(StorageError::CorruptLog(format!(
                    "{}: incomplete frame at offset {}",
                    key, offset
                )));
            }
            FrameRead::Corrupt(reason) => {
                return Err(StorageError::CorruptLog(format!(
                    "{}: bad frame at offset {}: {}",
                    key, offset, reason
                )));
            }
        }
    }

    decoded.valid_len = offset;
    Ok(decoded)
}
