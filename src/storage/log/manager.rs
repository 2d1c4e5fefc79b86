//! Tiered segment management.
//!
//! This module owns the segment index of the log:
//! - Appends to the active segment on the latest-log disk
//! - Sealing and rotation on entry count, size or age
//! - Migration of sealed segments to the cold log disk
//! - Discovery of all segments on startup
//! - Cross-segment reads and compaction behind a snapshot

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::CoordinationSettings;
use crate::error::StorageError;
use crate::message::LogEntry;
use crate::storage::disk::{Disk, DiskRoles};
use crate::traits::StorageResult;

use super::entry::encode_frame;
use super::naming::{LOGS_SUB_PATH, StorageRole, parse_storage_key};
use super::segment::{ActiveSegment, DecodedSegment, SegmentDescriptor, SegmentPhase, decode_segment};

/// Key of the last sealed index on the latest-log disk.
pub const HIGH_WATER_MARK_KEY: &str = "state/high_water_mark";

/// Rotation triggers of the active segment.
#[derive(Debug, Clone)]
pub struct TieredLogOptions {
    /// Entries per segment.
    pub rotate_interval: u64,
    /// Bytes per segment.
    pub max_segment_bytes: u64,
    /// Age of a non-empty active segment.
    pub rotate_period: Option<Duration>,
}

impl Default for TieredLogOptions {
    fn default() -> Self {
        Self::from(&CoordinationSettings::default())
    }
}

impl From<&CoordinationSettings> for TieredLogOptions {
    fn from(settings: &CoordinationSettings) -> Self {
        Self {
            rotate_interval: settings.rotate_log_storage_interval.max(1),
            max_segment_bytes: settings.max_log_file_size.max(1),
            rotate_period: settings.rotate_period(),
        }
    }
}

/// Point-in-time view of the store.
#[derive(Debug, Clone)]
pub struct LogStoreStatus {
    pub first_index: u64,
    pub last_index: u64,
    pub last_term: u64,
    pub active_first_index: u64,
    pub active_entries: usize,
    pub active_bytes: u64,
    pub active_age: Duration,
    pub high_water_mark: u64,
    pub segments: Vec<SegmentDescriptor>,
}

/// Copy of one sealed segment to the cold disk, run outside the store.
#[derive(Debug, Clone)]
pub struct MigrationTask {
    pub segment: SegmentDescriptor,
    source: Arc<dyn Disk>,
    target: Arc<dyn Disk>,
}

fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

impl MigrationTask {
    pub fn segment_id(&self) -> u64 {
        self.segment.id
    }

    /// Copies the blob and verifies the remote copy by re-reading it.
    ///
    /// The local copy is left alone; it is deleted by
    /// [`TieredLogStore::finish_migration`] once this succeeded.
    pub async fn run(&self) -> StorageResult<()> {
        let key = self.segment.key.as_str();
        let data = self.source.get(key).await.map_err(|e| {
            warn!("Failed to read {} for migration: {}", key, e);
            StorageError::Disk(e)
        })?;
        let digest = sha256_digest(&data);

        self.target
            .put(key, data.clone())
            .await
            .map_err(|source| StorageError::Write {
                key: key.to_string(),
                source,
            })?;

        let copied = self.target.get(key).await?;
        let copied_digest = sha256_digest(&copied);
        if copied_digest != digest {
            warn!(
                "Migrated copy of {} on {} does not match: {} != {}",
                key,
                self.target.name(),
                copied_digest,
                digest
            );
            return Err(StorageError::CorruptLog(format!(
                "migrated copy of {} failed verification",
                key
            )));
        }

        debug!(
            "Copied {} ({} bytes) from {} to {}",
            key,
            data.len(),
            self.source.name(),
            self.target.name()
        );
        Ok(())
    }
}

/// The tiered log: sealed segments on either disk plus one active segment.
///
/// Methods taking `&mut self` are only ever called by the single writer
/// task (or by recovery, before that task starts).
#[derive(Debug)]
pub struct TieredLogStore {
    options: TieredLogOptions,
    roles: DiskRoles,
    /// Sealed segments keyed by first index.
    sealed: BTreeMap<u64, SegmentDescriptor>,
    active: ActiveSegment,
    last_term: u64,
    high_water_mark: u64,
    /// The open blob may hold bytes past `active.buffer`; the next append
    /// rewrites it whole.
    active_dirty: bool,
}

impl TieredLogStore {
    /// An empty store whose first entry will be index 1.
    pub fn new(roles: DiskRoles, options: TieredLogOptions) -> Self {
        Self {
            options,
            roles,
            sealed: BTreeMap::new(),
            active: ActiveSegment::new(1),
            last_term: 0,
            high_water_mark: 0,
            active_dirty: false,
        }
    }

    pub fn roles(&self) -> &DiskRoles {
        &self.roles
    }

    pub fn options(&self) -> &TieredLogOptions {
        &self.options
    }

    /// First retained index, or `last_index + 1` when the log is empty.
    pub fn first_index(&self) -> u64 {
        self.sealed
            .values()
            .next()
            .map(|s| s.first_index)
            .unwrap_or(self.active.first_index())
    }

    pub fn last_index(&self) -> u64 {
        self.active
            .last_index()
            .unwrap_or(self.active.first_index().saturating_sub(1))
    }

    pub fn last_term(&self) -> u64 {
        self.active.last_term().unwrap_or(self.last_term)
    }

    pub fn high_water_mark(&self) -> u64 {
        self.high_water_mark
    }

    pub fn entries_since_rotation(&self) -> usize {
        self.active.len()
    }

    /// Sealed segments ascending, followed by the active one.
    pub fn segments(&self) -> Vec<SegmentDescriptor> {
        let mut segments: Vec<_> = self.sealed.values().cloned().collect();
        let mut active = SegmentDescriptor::open(self.active.first_index(), self.roles.latest_log.name());
        active.phase = self.active.phase;
        segments.push(active);
        segments
    }

    pub fn status(&self) -> LogStoreStatus {
        LogStoreStatus {
            first_index: self.first_index(),
            last_index: self.last_index(),
            last_term: self.last_term(),
            active_first_index: self.active.first_index(),
            active_entries: self.active.len(),
            active_bytes: self.active.size_bytes(),
            active_age: self.active.opened_at.elapsed(),
            high_water_mark: self.high_water_mark,
            segments: self.segments(),
        }
    }

    fn disk_by_name(&self, name: &str) -> StorageResult<&Arc<dyn Disk>> {
        if self.roles.latest_log.name() == name {
            Ok(&self.roles.latest_log)
        } else if self.roles.log.name() == name {
            Ok(&self.roles.log)
        } else {
            Err(StorageError::NotFound(format!("disk {}", name)))
        }
    }

    /// Installs the state reconstructed by recovery.
    ///
    /// `last_term` is the term of the entry at `active.first_index - 1`
    /// when the active segment is empty.
    pub fn install(
        &mut self,
        sealed: Vec<SegmentDescriptor>,
        active: ActiveSegment,
        last_term: u64,
        high_water_mark: u64,
    ) {
        self.sealed = sealed.into_iter().map(|s| (s.first_index, s)).collect();
        self.active = active;
        self.last_term = last_term;
        self.high_water_mark = high_water_mark;
        self.active_dirty = false;
        info!(
            "Log store installed: {} sealed segments, active from {} with {} entries, last index {}",
            self.sealed.len(),
            self.active.first_index(),
            self.active.len(),
            self.last_index()
        );
    }

    /// Appends one entry to the active segment; returns its index.
    pub async fn append(&mut self, entry: LogEntry) -> StorageResult<u64> {
        let last = self.last_index();
        if entry.index != last + 1 {
            return Err(StorageError::NonContiguousAppend {
                last,
                got: entry.index,
            });
        }

        let frame = encode_frame(&entry).map_err(|e| StorageError::Codec(e.to_string()))?;
        let disk = self.roles.latest_log.clone();
        let key = self.active.key();

        let appended = if self.active_dirty || !disk.supports_append() {
            None
        } else {
            Some(disk.append(key.as_str(), Bytes::copy_from_slice(&frame)).await)
        };

        match appended {
            Some(Ok(())) => {}
            failed => {
                match failed {
                    Some(Err(e)) => warn!(
                        "Append of index {} to {} failed, rewriting segment: {}",
                        entry.index, key, e
                    ),
                    _ if self.active_dirty => {
                        debug!("Rewriting {} after an earlier failed write", key)
                    }
                    _ => {}
                }
                let mut whole = Vec::with_capacity(self.active.buffer.len() + frame.len());
                whole.extend_from_slice(&self.active.buffer);
                whole.extend_from_slice(&frame);
                if let Err(source) = disk.put(key.as_str(), Bytes::from(whole)).await {
                    // a partial frame may now sit in the blob
                    self.active_dirty = true;
                    warn!("Rewrite of {} failed: {}", key, source);
                    return Err(StorageError::Write {
                        key: key.to_string(),
                        source,
                    });
                }
                self.active_dirty = false;
            }
        }

        let index = entry.index;
        self.active.push(entry, &frame);

        if self.threshold_reached() {
            // the entry is durable; the scheduler retries the seal
            if let Err(e) = self.seal_and_rotate().await {
                warn!("Index {} is durable but sealing failed: {}", index, e);
            }
        }
        Ok(index)
    }

    fn threshold_reached(&self) -> bool {
        self.active.len() as u64 >= self.options.rotate_interval
            || self.active.size_bytes() >= self.options.max_segment_bytes
    }

    /// Whether a count, size or age trigger fired for a non-empty active segment.
    pub fn rotation_due(&self, now: Instant) -> bool {
        if !self.active.is_empty() && self.threshold_reached() {
            return true;
        }
        match self.options.rotate_period {
            Some(period) if !self.active.is_empty() => {
                now.saturating_duration_since(self.active.opened_at) >= period
            }
            _ => false,
        }
    }

    /// Seals the active segment if a trigger fired, including a threshold
    /// whose inline seal failed.
    pub async fn rotate_if_due(&mut self) -> StorageResult<Option<SegmentDescriptor>> {
        if self.rotation_due(Instant::now()) {
            self.seal_and_rotate().await
        } else {
            Ok(None)
        }
    }

    /// Closes the active segment under its final key and opens the next one.
    ///
    /// Returns `None` when the active segment holds no entries.
    pub async fn seal_and_rotate(&mut self) -> StorageResult<Option<SegmentDescriptor>> {
        let (first, last) = match self.active.last_index() {
            Some(last) => (self.active.first_index(), last),
            None => return Ok(None),
        };
        let disk = self.roles.latest_log.clone();
        let descriptor = SegmentDescriptor::sealed(first, last, disk.name());
        let open_key = self.active.key();

        self.active.phase = SegmentPhase::Sealing;
        let sealed_bytes = Bytes::from(self.active.buffer.clone());
        if let Err(source) = disk.put(descriptor.key.as_str(), sealed_bytes).await {
            self.active.phase = SegmentPhase::Open;
            warn!("Failed to seal segment {}: {}", descriptor.key, source);
            return Err(StorageError::Write {
                key: descriptor.key.to_string(),
                source,
            });
        }

        // A leftover open key is dropped by discovery.
        if let Err(e) = disk.delete(open_key.as_str()).await {
            warn!("Failed to remove open segment {}: {}", open_key, e);
        }

        self.high_water_mark = self.high_water_mark.max(last);
        if let Err(e) = disk
            .put(
                HIGH_WATER_MARK_KEY,
                Bytes::from(self.high_water_mark.to_string()),
            )
            .await
        {
            warn!("Failed to record high-water mark {}: {}", self.high_water_mark, e);
        }

        self.last_term = self.active.last_term().unwrap_or(self.last_term);
        self.active = ActiveSegment::new(last + 1);
        self.active_dirty = false;
        self.sealed.insert(first, descriptor.clone());

        info!(
            "Sealed segment {}..={} on {} ({}), next active starts at {}",
            first,
            last,
            disk.name(),
            descriptor.key,
            last + 1
        );
        Ok(Some(descriptor))
    }

    /// Sealed segments on the hot disk that may move to the cold disk.
    ///
    /// The newest `reserved_log_items` entries stay on the hot disk.
    pub fn migration_candidates(&self, reserved_log_items: u64) -> Vec<u64> {
        if !self.roles.is_tiered() {
            return self
                .sealed
                .values()
                .filter(|s| s.phase == SegmentPhase::Sealed)
                .map(|s| s.id)
                .collect();
        }
        let last_index = self.last_index();
        let hot = self.roles.latest_log.name();
        self.sealed
            .values()
            .filter(|s| s.phase == SegmentPhase::Sealed && s.disk_id == hot)
            .filter(|s| {
                s.last_index
                    .is_some_and(|last| last.saturating_add(reserved_log_items) <= last_index)
            })
            .map(|s| s.id)
            .collect()
    }

    /// Marks a sealed segment as migrating and hands out the copy job.
    ///
    /// Without a separate cold disk the segment is marked migrated in place
    /// and no task is returned.
    pub fn begin_migration(&mut self, id: u64) -> StorageResult<Option<MigrationTask>> {
        let tiered = self.roles.is_tiered();
        let source = self.roles.latest_log.clone();
        let target = self.roles.log.clone();

        let segment = self
            .sealed
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("segment {}", id)))?;
        if segment.phase != SegmentPhase::Sealed {
            debug!("Segment {} is {:?}, not migrating", id, segment.phase);
            return Ok(None);
        }

        if !tiered {
            segment.phase = SegmentPhase::Migrated;
            return Ok(None);
        }

        segment.phase = SegmentPhase::Migrating;
        Ok(Some(MigrationTask {
            segment: segment.clone(),
            source,
            target,
        }))
    }

    /// Applies the outcome of a migration task.
    ///
    /// On success the local copy is deleted and the segment points at the
    /// cold disk. On failure the segment returns to `Sealed` and the next
    /// scheduler tick tries again.
    pub async fn finish_migration(&mut self, id: u64, outcome: StorageResult<()>) -> StorageResult<()> {
        let cold = self.roles.log.name().to_string();
        let hot = self.roles.latest_log.clone();

        let segment = match self.sealed.get_mut(&id) {
            Some(segment) => segment,
            None => {
                debug!("Segment {} was compacted during migration", id);
                return outcome;
            }
        };

        if let Err(e) = outcome {
            warn!("Migration of segment {} failed: {}", segment.key, e);
            segment.phase = SegmentPhase::Sealed;
            return Err(e);
        }

        segment.disk_id = cold;
        segment.phase = SegmentPhase::Migrated;
        let key = segment.key.clone();
        info!("Migrated segment {} to {}", key, segment.disk_id);

        // The verified remote copy already exists; a leftover local copy is
        // preferred by discovery and removed again by compaction.
        if let Err(e) = hot.delete(key.as_str()).await {
            warn!("Failed to delete local copy of {}: {}", key, e);
        }
        Ok(())
    }

    /// Begins, runs and finishes one migration in place.
    pub async fn migrate(&mut self, id: u64) -> StorageResult<()> {
        match self.begin_migration(id)? {
            Some(task) => {
                let outcome = task.run().await;
                self.finish_migration(id, outcome).await
            }
            None => Ok(()),
        }
    }

    async fn list_segments(&self, disk: &Arc<dyn Disk>) -> StorageResult<Vec<SegmentDescriptor>> {
        let keys = disk
            .list(LOGS_SUB_PATH)
            .await
            .map_err(|source| StorageError::Discovery {
                disk: disk.name().to_string(),
                source,
            })?;

        let mut found = Vec::new();
        for key in keys {
            match parse_storage_key(&key) {
                Some((StorageRole::Log, range)) => {
                    found.push(SegmentDescriptor::from_range(range, disk.name()));
                }
                _ => debug!("Ignoring foreign blob {} on {}", key, disk.name()),
            }
        }
        Ok(found)
    }

    /// Lists both log disks and rebuilds the ordered segment list.
    ///
    /// Copies present on both disks collapse to the local one. An open key
    /// whose range was already sealed is a leftover of an interrupted seal
    /// and is deleted. Any gap or overlap is `CorruptLog`.
    pub async fn discover(&self) -> StorageResult<Vec<SegmentDescriptor>> {
        let hot = &self.roles.latest_log;
        let mut segments = self.list_segments(hot).await?;

        if self.roles.is_tiered() {
            for mut segment in self.list_segments(&self.roles.log).await? {
                if segments.iter().any(|s| s.key == segment.key) {
                    info!(
                        "Segment {} found on both {} and {}, using the local copy",
                        segment.key,
                        hot.name(),
                        segment.disk_id
                    );
                    continue;
                }
                segment.phase = SegmentPhase::Migrated;
                segments.push(segment);
            }
        }
        segments.sort_by_key(|s| (s.first_index, s.is_open()));

        let sealed_firsts: Vec<u64> = segments
            .iter()
            .filter(|s| !s.is_open())
            .map(|s| s.first_index)
            .collect();
        let (stale, segments): (Vec<_>, Vec<_>) = segments
            .into_iter()
            .partition(|s| s.is_open() && sealed_firsts.contains(&s.first_index));
        for segment in stale {
            warn!(
                "Dropping stale open segment {} on {}",
                segment.key, segment.disk_id
            );
            let disk = self.disk_by_name(&segment.disk_id)?;
            if let Err(e) = disk.delete(segment.key.as_str()).await {
                warn!("Failed to delete stale {}: {}", segment.key, e);
            }
        }

        verify_contiguous(&segments)?;
        let cold = segments
            .iter()
            .filter(|s| s.phase == SegmentPhase::Migrated)
            .count();
        info!(
            "Discovered {} segments, {} of them on {}",
            segments.len(),
            cold,
            self.roles.log.name()
        );
        Ok(segments)
    }

    /// Reads and decodes one segment blob from the disk holding it.
    pub async fn load_segment(&self, segment: &SegmentDescriptor) -> StorageResult<(DecodedSegment, Bytes)> {
        let disk = self.disk_by_name(&segment.disk_id)?;
        let data = match disk.get(segment.key.as_str()).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                warn!("Segment {} vanished from {}", segment.key, segment.disk_id);
                return Err(StorageError::NotFound(segment.key.to_string()));
            }
            Err(e) => return Err(StorageError::Disk(e)),
        };

        let decoded = decode_segment(&segment.key, &data, segment.is_open())?;
        if let Some(first) = decoded.entries.first() {
            if first.index != segment.first_index {
                return Err(StorageError::CorruptLog(format!(
                    "{} starts at index {}",
                    segment.key, first.index
                )));
            }
        }
        if let Some(last) = segment.last_index {
            let decoded_last = decoded.entries.last().map(|e| e.index);
            if decoded_last != Some(last) {
                return Err(StorageError::CorruptLog(format!(
                    "{} ends at {:?}, expected {}",
                    segment.key, decoded_last, last
                )));
            }
        }
        Ok((decoded, data))
    }

    /// Reads the recorded high-water mark, 0 when none was written yet.
    pub async fn read_high_water_mark(&self) -> StorageResult<u64> {
        match self.roles.latest_log.get(HIGH_WATER_MARK_KEY).await {
            Ok(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| StorageError::CorruptLog("unreadable high-water mark".to_string())),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(StorageError::Disk(e)),
        }
    }

    /// Entries with index in `[low, high)`, across segments.
    pub async fn read_entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>> {
        let high = high.min(self.last_index() + 1);
        if low >= high {
            return Ok(Vec::new());
        }
        if low < self.first_index() {
            return Err(StorageError::NotFound(format!(
                "index {} (log starts at {})",
                low,
                self.first_index()
            )));
        }

        let mut entries = Vec::with_capacity((high - low) as usize);
        for segment in self.sealed.values().filter(|s| s.overlaps(low, high)) {
            let (decoded, _) = self.load_segment(segment).await?;
            entries.extend(
                decoded
                    .entries
                    .into_iter()
                    .filter(|e| e.index >= low && e.index < high),
            );
        }
        entries.extend_from_slice(self.active.slice(low, high));

        let expected = (high - low) as usize;
        if entries.len() != expected {
            return Err(StorageError::CorruptLog(format!(
                "read [{}, {}) returned {} entries",
                low,
                high,
                entries.len()
            )));
        }
        Ok(entries)
    }

    /// Deletes sealed segments whose entries are all at or below `up_to_index`.
    ///
    /// Segments with a migration in flight are kept for the next round.
    pub async fn compact(&mut self, up_to_index: u64) -> StorageResult<usize> {
        let victims: Vec<SegmentDescriptor> = self
            .sealed
            .values()
            .filter(|s| s.last_index.is_some_and(|last| last <= up_to_index))
            .filter(|s| s.phase != SegmentPhase::Migrating)
            .cloned()
            .collect();

        let mut removed = 0;
        for segment in victims {
            let mut disks = vec![self.roles.latest_log.clone()];
            if self.roles.is_tiered() {
                disks.push(self.roles.log.clone());
            }
            for disk in disks {
                disk.delete(segment.key.as_str()).await.map_err(|source| {
                    warn!("Failed to delete compacted {}: {}", segment.key, source);
                    StorageError::Write {
                        key: segment.key.to_string(),
                        source,
                    }
                })?;
            }
            self.sealed.remove(&segment.first_index);
            removed += 1;
        }

        if removed > 0 {
            info!(
                "Compacted {} segments up to index {}, log now starts at {}",
                removed,
                up_to_index,
                self.first_index()
            );
        }
        Ok(removed)
    }
}

/// Checks that discovered segments tile the index space without gaps or
/// overlaps and that at most one open segment exists, at the tail.
pub fn verify_contiguous(segments: &[SegmentDescriptor]) -> StorageResult<()> {
    let open_count = segments.iter().filter(|s| s.is_open()).count();
    if open_count > 1 {
        return Err(StorageError::CorruptLog(format!(
            "{} open segments found",
            open_count
        )));
    }

    for pair in segments.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let prev_last = match prev.last_index {
            Some(last) => last,
            None => {
                return Err(StorageError::CorruptLog(format!(
                    "open segment {} is followed by {}",
                    prev.key, next.key
                )));
            }
        };
        if next.first_index <= prev_last {
            return Err(StorageError::CorruptLog(format!(
                "segments {} and {} overlap",
                prev.key, next.key
            )));
        }
        if next.first_index != prev_last + 1 {
            return Err(StorageError::CorruptLog(format!(
                "gap between {} and {}: indices {}..{} missing",
                prev.key,
                next.key,
                prev_last + 1,
                next.first_index
            )));
        }
    }
    Ok(())
}
