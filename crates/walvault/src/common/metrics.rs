//! Backup observability counters.
//!
//! Lock-free atomic counters with a `snapshot()` view. This is a facade:
//! call sites record events and never block; wiring the values into an
//! exporter is someone else's job.

use crate::common::Lsn;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Kinds of decoded messages written to table segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Begin,
    Commit,
    Relation,
    Type,
    Insert,
    Update,
    Delete,
    Truncate,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Begin => "begin",
            MessageKind::Commit => "commit",
            MessageKind::Relation => "relation",
            MessageKind::Type => "type",
            MessageKind::Insert => "insert",
            MessageKind::Update => "update",
            MessageKind::Delete => "delete",
            MessageKind::Truncate => "truncate",
        }
    }
}

/// Counters for the whole backup process.
#[derive(Debug)]
pub struct BackupMetrics {
    started: Instant,
    window_started: Mutex<Instant>,

    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    begins: AtomicU64,
    commits: AtomicU64,
    relations: AtomicU64,
    types: AtomicU64,
    truncates: AtomicU64,

    bytes_written: AtomicU64,
    window_messages: AtomicU64,
    window_bytes: AtomicU64,

    transactions: AtomicU64,
    segments_archived: AtomicU64,
    segments_archived_on_timeout: AtomicU64,
    basebackups_completed: AtomicU64,
    basebackups_failed: AtomicU64,

    flush_lsn: AtomicU64,
    last_commit_timestamp: AtomicI64,
}

impl BackupMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            window_started: Mutex::new(now),
            inserts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            begins: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            relations: AtomicU64::new(0),
            types: AtomicU64::new(0),
            truncates: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            window_messages: AtomicU64::new(0),
            window_bytes: AtomicU64::new(0),
            transactions: AtomicU64::new(0),
            segments_archived: AtomicU64::new(0),
            segments_archived_on_timeout: AtomicU64::new(0),
            basebackups_completed: AtomicU64::new(0),
            basebackups_failed: AtomicU64::new(0),
            flush_lsn: AtomicU64::new(0),
            last_commit_timestamp: AtomicI64::new(0),
        }
    }

    /// Record one message written to a table segment.
    pub fn record_message(&self, kind: MessageKind, bytes: u64) {
        let counter = match kind {
            MessageKind::Begin => &self.begins,
            MessageKind::Commit => &self.commits,
            MessageKind::Relation => &self.relations,
            MessageKind::Type => &self.types,
            MessageKind::Insert => &self.inserts,
            MessageKind::Update => &self.updates,
            MessageKind::Delete => &self.deletes,
            MessageKind::Truncate => &self.truncates,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.window_messages.fetch_add(1, Ordering::Relaxed);
        self.window_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_transaction(&self, commit_timestamp: i64) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
        self.last_commit_timestamp
            .store(commit_timestamp, Ordering::Relaxed);
    }

    pub fn record_segment_archived(&self, on_timeout: bool) {
        self.segments_archived.fetch_add(1, Ordering::Relaxed);
        if on_timeout {
            self.segments_archived_on_timeout
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_basebackup(&self, ok: bool) {
        if ok {
            self.basebackups_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.basebackups_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_flush_lsn(&self, lsn: Lsn) {
        self.flush_lsn.store(lsn.as_u64(), Ordering::Relaxed);
    }

    pub fn flush_lsn(&self) -> Lsn {
        Lsn(self.flush_lsn.load(Ordering::Relaxed))
    }

    /// Drain the interval window: messages and bytes written since the
    /// previous call. Used for the periodic status-report log line.
    pub fn take_window(&self) -> WindowStats {
        let mut started = self.window_started.lock().expect("metrics clock poisoned");
        let elapsed = started.elapsed();
        *started = Instant::now();
        WindowStats {
            messages: self.window_messages.swap(0, Ordering::Relaxed),
            bytes: self.window_bytes.swap(0, Ordering::Relaxed),
            elapsed,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime: self.started.elapsed(),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            begins: self.begins.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            relations: self.relations.load(Ordering::Relaxed),
            types: self.types.load(Ordering::Relaxed),
            truncates: self.truncates.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            segments_archived: self.segments_archived.load(Ordering::Relaxed),
            segments_archived_on_timeout: self.segments_archived_on_timeout.load(Ordering::Relaxed),
            basebackups_completed: self.basebackups_completed.load(Ordering::Relaxed),
            basebackups_failed: self.basebackups_failed.load(Ordering::Relaxed),
            flush_lsn: Lsn(self.flush_lsn.load(Ordering::Relaxed)),
            last_commit_timestamp: self.last_commit_timestamp.load(Ordering::Relaxed),
        }
    }
}

impl Default for BackupMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Messages and bytes written over one reporting interval.
#[derive(Debug, Clone, Copy)]
pub struct WindowStats {
    pub messages: u64,
    pub bytes: u64,
    pub elapsed: std::time::Duration,
}

/// Point-in-time view of all counters.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub uptime: std::time::Duration,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub begins: u64,
    pub commits: u64,
    pub relations: u64,
    pub types: u64,
    pub truncates: u64,
    pub bytes_written: u64,
    pub transactions: u64,
    pub segments_archived: u64,
    pub segments_archived_on_timeout: u64,
    pub basebackups_completed: u64,
    pub basebackups_failed: u64,
    pub flush_lsn: Lsn,
    pub last_commit_timestamp: i64,
}
