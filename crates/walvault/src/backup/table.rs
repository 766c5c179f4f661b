//! Per-table writer.
//!
//! Owns exactly one table's output: an append-only delta segment open in
//! staging, rotated into the archive on a record-count threshold, on
//! inactivity, or on stop. Each record is framed `{u64 lsn, u32 len,
//! bytes}` big-endian. The writer's durably flushed LSN only advances when
//! a segment lands in the archive; the engine's global flush computation
//! reads it through atomics and never touches the file lock.

use crate::backup::state::sync_dir;
use crate::common::{BackupError, BackupMetrics, Lsn, NamespacedName, Oid, Result};
use crate::postgres::SnapshotExecutor;
use bytes::{BufMut, BytesMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DELTA_SUFFIX: &str = "delta";
const SNAPSHOT_SUFFIX: &str = "snapshot";
const BASEBACKUP_TMP: &str = "basebackup.tmp";

/// Why a segment was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RotateReason {
    RecordCount,
    Inactivity,
    Stop,
    Basebackup,
}

struct OpenSegment {
    file: tokio::fs::File,
    path: PathBuf,
    id: u64,
    records: u32,
}

struct SegmentSlot {
    open: Option<OpenSegment>,
    next_id: u64,
}

/// Writer for one tracked table.
#[derive(Debug)]
pub struct TableWriter {
    oid: Oid,
    name: RwLock<NamespacedName>,
    staging_dir: PathBuf,
    archive_dir: PathBuf,
    deltas_per_file: u32,
    fsync: bool,
    metrics: Arc<BackupMetrics>,

    segment: Mutex<SegmentSlot>,

    last_seen_lsn: AtomicU64,
    flushed_lsn: AtomicU64,
    flush_required: AtomicBool,
    basebackup_pending: AtomicBool,
    messages_since_backup: AtomicU64,
    stopped: AtomicBool,

    created: Instant,
    /// Milliseconds since `created` of the last write, plus one; zero
    /// means no write has happened yet.
    last_write_ms: AtomicU64,
}

impl std::fmt::Debug for SegmentSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentSlot")
            .field("open", &self.open.as_ref().map(|s| s.id))
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl TableWriter {
    /// Set up the writer's directories and recover from any prior crash:
    /// partial staging segments are discarded (the slot will redeliver)
    /// and segment numbering continues above the archive's maximum.
    pub async fn new(
        oid: Oid,
        name: NamespacedName,
        staging_root: impl Into<PathBuf>,
        archive_root: impl Into<PathBuf>,
        deltas_per_file: u32,
        fsync: bool,
        metrics: Arc<BackupMetrics>,
    ) -> Result<Arc<Self>> {
        let staging_dir = staging_root.into().join(oid.to_string());
        let archive_dir = archive_root.into().join(oid.to_string());
        tokio::fs::create_dir_all(&staging_dir).await?;
        tokio::fs::create_dir_all(&archive_dir).await?;

        discard_staging_leftovers(&staging_dir).await?;
        let next_id = max_archived_segment_id(&archive_dir).await? + 1;

        Ok(Arc::new(Self {
            oid,
            name: RwLock::new(name),
            staging_dir,
            archive_dir,
            deltas_per_file: deltas_per_file.max(1),
            fsync,
            metrics,
            segment: Mutex::new(SegmentSlot {
                open: None,
                next_id,
            }),
            last_seen_lsn: AtomicU64::new(0),
            flushed_lsn: AtomicU64::new(0),
            flush_required: AtomicBool::new(false),
            basebackup_pending: AtomicBool::new(false),
            messages_since_backup: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            created: Instant::now(),
            last_write_ms: AtomicU64::new(0),
        }))
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn name(&self) -> NamespacedName {
        self.name.read().expect("writer name poisoned").clone()
    }

    /// Track a rename observed on the change stream.
    pub fn set_name(&self, name: NamespacedName) {
        *self.name.write().expect("writer name poisoned") = name;
    }

    /// Append one framed record. Returns the number of bytes written.
    pub async fn write_delta(
        &self,
        raw: &[u8],
        _tx_commit_lsn: Lsn,
        record_lsn: Lsn,
    ) -> Result<u64> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BackupError::invalid_state(format!(
                "writer for table {} is stopped",
                self.oid
            )));
        }

        let mut slot = self.segment.lock().await;
        if slot.open.is_none() {
            let id = slot.next_id;
            slot.next_id += 1;
            let path = self.staging_dir.join(format!("{id:016x}.{DELTA_SUFFIX}"));
            let file = tokio::fs::File::create(&path).await?;
            debug!(table = %self.oid, segment = id, "opened segment");
            slot.open = Some(OpenSegment {
                file,
                path,
                id,
                records: 0,
            });
        }

        let mut frame = BytesMut::with_capacity(12 + raw.len());
        frame.put_u64(record_lsn.as_u64());
        frame.put_u32(raw.len() as u32);
        frame.put_slice(raw);

        let open = slot.open.as_mut().expect("segment just opened");
        open.file.write_all(&frame).await?;
        open.records += 1;

        self.last_seen_lsn.store(record_lsn.as_u64(), Ordering::SeqCst);
        self.flush_required.store(true, Ordering::SeqCst);
        self.messages_since_backup.fetch_add(1, Ordering::Relaxed);
        self.touch();

        if open.records >= self.deltas_per_file {
            self.finalize_locked(&mut slot, RotateReason::RecordCount)
                .await?;
        }

        Ok(frame.len() as u64)
    }

    /// The writer's durable flush position and whether it currently holds
    /// unflushed content. Never blocks on I/O.
    pub fn get_flush_lsn(&self) -> (Lsn, bool) {
        (
            Lsn(self.flushed_lsn.load(Ordering::SeqCst)),
            self.flush_required.load(Ordering::SeqCst),
        )
    }

    pub fn last_seen_lsn(&self) -> Lsn {
        Lsn(self.last_seen_lsn.load(Ordering::SeqCst))
    }

    /// Rotate the open segment if nothing has been written for `timeout`.
    pub async fn maybe_rotate_inactive(&self, timeout: Duration) -> Result<()> {
        if !self.flush_required.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.inactive_for() < timeout {
            return Ok(());
        }
        let mut slot = self.segment.lock().await;
        if slot.open.is_some() {
            self.finalize_locked(&mut slot, RotateReason::Inactivity)
                .await?;
        }
        Ok(())
    }

    /// Close and archive the open segment on demand.
    pub async fn rotate(&self) -> Result<()> {
        let mut slot = self.segment.lock().await;
        self.finalize_locked(&mut slot, RotateReason::Basebackup)
            .await
    }

    /// Flush and stop. Idempotent; later writes are rejected.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut slot = self.segment.lock().await;
        self.finalize_locked(&mut slot, RotateReason::Stop).await
    }

    /// Take a base snapshot of the table through `executor`.
    ///
    /// The open segment is rotated first so the snapshot anchors a clean
    /// segment boundary; on success the snapshot lands in the archive
    /// named by the anchor LSN.
    pub async fn run_basebackup(&self, executor: &dyn SnapshotExecutor) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.rotate().await?;

        let name = self.name();
        let tmp_path = self.staging_dir.join(BASEBACKUP_TMP);
        let result = self.snapshot_into(executor, &name, &tmp_path).await;

        match result {
            Ok(bytes) => {
                self.messages_since_backup.store(0, Ordering::Relaxed);
                self.metrics.record_basebackup(true);
                info!(table = %name, oid = %self.oid, bytes, "base snapshot archived");
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                self.metrics.record_basebackup(false);
                Err(e)
            }
        }
    }

    async fn snapshot_into(
        &self,
        executor: &dyn SnapshotExecutor,
        name: &NamespacedName,
        tmp_path: &PathBuf,
    ) -> Result<u64> {
        let mut file = tokio::fs::File::create(tmp_path).await?;
        let bytes = executor.copy_table(name, &mut file).await?;
        file.flush().await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        let anchor = self.last_seen_lsn.load(Ordering::SeqCst);
        let dest = self
            .archive_dir
            .join(format!("{anchor:016x}.{SNAPSHOT_SUFFIX}"));
        tokio::fs::rename(tmp_path, &dest).await?;
        if self.fsync {
            sync_dir(&self.staging_dir).await?;
            sync_dir(&self.archive_dir).await?;
        }
        Ok(bytes)
    }

    /// Claim the right to schedule a snapshot. Returns false when one is
    /// already queued or running.
    pub fn set_basebackup_pending(&self) -> bool {
        self.basebackup_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn clear_basebackup_pending(&self) {
        self.basebackup_pending.store(false, Ordering::SeqCst);
    }

    pub fn messages_since_backup(&self) -> u64 {
        self.messages_since_backup.load(Ordering::Relaxed)
    }

    /// Time since the last write (or since creation if nothing was ever
    /// written).
    pub fn inactive_for(&self) -> Duration {
        let elapsed = self.created.elapsed();
        match self.last_write_ms.load(Ordering::SeqCst) {
            0 => elapsed,
            ms => elapsed.saturating_sub(Duration::from_millis(ms - 1)),
        }
    }

    fn touch(&self) {
        let ms = self.created.elapsed().as_millis() as u64;
        self.last_write_ms.store(ms + 1, Ordering::SeqCst);
    }

    async fn finalize_locked(
        &self,
        slot: &mut SegmentSlot,
        reason: RotateReason,
    ) -> Result<()> {
        let Some(open) = slot.open.take() else {
            return Ok(());
        };

        let OpenSegment {
            mut file,
            path,
            id,
            records,
        } = open;

        file.flush().await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);
        if self.fsync {
            sync_dir(&self.staging_dir).await?;
        }

        let dest = self.archive_dir.join(
            path.file_name()
                .expect("segment path always has a file name"),
        );
        tokio::fs::rename(&path, &dest).await?;
        if self.fsync {
            sync_dir(&self.archive_dir).await?;
        }

        let last_seen = self.last_seen_lsn.load(Ordering::SeqCst);
        self.flushed_lsn.store(last_seen, Ordering::SeqCst);
        self.flush_required.store(false, Ordering::SeqCst);
        self.metrics
            .record_segment_archived(reason == RotateReason::Inactivity);

        debug!(
            table = %self.oid,
            segment = id,
            records,
            flushed = %Lsn(last_seen),
            ?reason,
            "archived segment"
        );
        Ok(())
    }
}

async fn discard_staging_leftovers(staging_dir: &PathBuf) -> Result<()> {
    let mut entries = tokio::fs::read_dir(staging_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let stale = path
            .extension()
            .is_some_and(|ext| ext == DELTA_SUFFIX || ext == "tmp");
        if stale {
            warn!(?path, "discarding partial file from a previous run");
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

async fn max_archived_segment_id(archive_dir: &PathBuf) -> Result<u64> {
    let mut max_id = 0u64;
    let mut entries = tokio::fs::read_dir(archive_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == DELTA_SUFFIX) {
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| u64::from_str_radix(s, 16).ok())
            {
                max_id = max_id.max(id);
            }
        }
    }
    Ok(max_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Buf;
    use tempfile::TempDir;

    async fn new_writer(dir: &TempDir, deltas_per_file: u32) -> Arc<TableWriter> {
        TableWriter::new(
            Oid(16384),
            NamespacedName::new("public", "t"),
            dir.path().join("staging"),
            dir.path().join("archive"),
            deltas_per_file,
            true,
            Arc::new(BackupMetrics::new()),
        )
        .await
        .unwrap()
    }

    fn archive_segments(dir: &TempDir) -> Vec<PathBuf> {
        let mut paths: Vec<_> = std::fs::read_dir(dir.path().join("archive").join("16384"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|x| x == "delta"))
            .collect();
        paths.sort();
        paths
    }

    fn parse_segment(path: &PathBuf) -> Vec<(Lsn, Vec<u8>)> {
        let mut raw = bytes::Bytes::from(std::fs::read(path).unwrap());
        let mut records = Vec::new();
        while raw.has_remaining() {
            let lsn = Lsn(raw.get_u64());
            let len = raw.get_u32() as usize;
            let body = raw.copy_to_bytes(len).to_vec();
            records.push((lsn, body));
        }
        records
    }

    #[tokio::test]
    async fn rotation_on_record_threshold_advances_flush() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(&dir, 2).await;

        writer.write_delta(b"one", Lsn(0x100), Lsn(0x90)).await.unwrap();
        let (flushed, needs) = writer.get_flush_lsn();
        assert_eq!(flushed, Lsn::INVALID);
        assert!(needs);
        assert!(archive_segments(&dir).is_empty());

        writer.write_delta(b"two", Lsn(0x100), Lsn(0x100)).await.unwrap();
        let (flushed, needs) = writer.get_flush_lsn();
        assert_eq!(flushed, Lsn(0x100));
        assert!(!needs);

        let segments = archive_segments(&dir);
        assert_eq!(segments.len(), 1);
        let records = parse_segment(&segments[0]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (Lsn(0x90), b"one".to_vec()));
        assert_eq!(records[1], (Lsn(0x100), b"two".to_vec()));
    }

    #[tokio::test]
    async fn segment_ids_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(&dir, 1).await;

        writer.write_delta(b"a", Lsn(1), Lsn(1)).await.unwrap();
        writer.write_delta(b"b", Lsn(2), Lsn(2)).await.unwrap();

        let segments = archive_segments(&dir);
        assert_eq!(segments.len(), 2);
        assert!(segments[0].ends_with("0000000000000001.delta"));
        assert!(segments[1].ends_with("0000000000000002.delta"));
    }

    #[tokio::test]
    async fn inactivity_rotation() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(&dir, 100).await;

        writer.write_delta(b"a", Lsn(0x40), Lsn(0x40)).await.unwrap();

        // not yet inactive long enough
        writer
            .maybe_rotate_inactive(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(archive_segments(&dir).is_empty());

        writer
            .maybe_rotate_inactive(Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(archive_segments(&dir).len(), 1);
        let (flushed, needs) = writer.get_flush_lsn();
        assert_eq!(flushed, Lsn(0x40));
        assert!(!needs);

        // nothing left to rotate
        writer.maybe_rotate_inactive(Duration::ZERO).await.unwrap();
        assert_eq!(archive_segments(&dir).len(), 1);
    }

    #[tokio::test]
    async fn stop_flushes_and_rejects_later_writes() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(&dir, 100).await;

        writer.write_delta(b"a", Lsn(5), Lsn(5)).await.unwrap();
        writer.stop().await.unwrap();
        writer.stop().await.unwrap(); // idempotent

        assert_eq!(archive_segments(&dir).len(), 1);
        assert!(writer.write_delta(b"b", Lsn(6), Lsn(6)).await.is_err());
    }

    #[tokio::test]
    async fn crash_recovery_discards_staging_and_continues_numbering() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("staging").join("16384");
        let archive = dir.path().join("archive").join("16384");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(&archive).unwrap();
        std::fs::write(staging.join("0000000000000007.delta"), b"partial").unwrap();
        std::fs::write(archive.join("0000000000000006.delta"), b"done").unwrap();

        let writer = new_writer(&dir, 1).await;
        assert!(!staging.join("0000000000000007.delta").exists());

        writer.write_delta(b"a", Lsn(9), Lsn(9)).await.unwrap();
        assert!(archive.join("0000000000000007.delta").exists());
    }

    #[tokio::test]
    async fn basebackup_pending_is_a_cas_guard() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(&dir, 4).await;

        assert!(writer.set_basebackup_pending());
        assert!(!writer.set_basebackup_pending());
        writer.clear_basebackup_pending();
        assert!(writer.set_basebackup_pending());
    }

    struct FixedSnapshot(&'static [u8]);

    #[async_trait]
    impl SnapshotExecutor for FixedSnapshot {
        async fn copy_table(
            &self,
            _table: &NamespacedName,
            dest: &mut tokio::fs::File,
        ) -> Result<u64> {
            dest.write_all(self.0).await?;
            Ok(self.0.len() as u64)
        }
    }

    struct MissingTable;

    #[async_trait]
    impl SnapshotExecutor for MissingTable {
        async fn copy_table(
            &self,
            table: &NamespacedName,
            _dest: &mut tokio::fs::File,
        ) -> Result<u64> {
            Err(BackupError::TableNotFound(table.to_string()))
        }
    }

    #[tokio::test]
    async fn basebackup_rotates_then_archives_snapshot() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(&dir, 100).await;

        writer.write_delta(b"a", Lsn(0x100), Lsn(0x100)).await.unwrap();
        assert_eq!(writer.messages_since_backup(), 1);

        writer.run_basebackup(&FixedSnapshot(b"id,name\n")).await.unwrap();

        // the open segment was rotated before the copy
        assert_eq!(archive_segments(&dir).len(), 1);

        let snapshot = dir
            .path()
            .join("archive")
            .join("16384")
            .join("0000000000000100.snapshot");
        assert_eq!(std::fs::read(&snapshot).unwrap(), b"id,name\n");
        assert_eq!(writer.messages_since_backup(), 0);
    }

    #[tokio::test]
    async fn basebackup_failure_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(&dir, 100).await;

        let err = writer.run_basebackup(&MissingTable).await.unwrap_err();
        assert!(matches!(err, BackupError::TableNotFound(_)));
        assert!(!dir
            .path()
            .join("staging")
            .join("16384")
            .join("basebackup.tmp")
            .exists());
    }
}
