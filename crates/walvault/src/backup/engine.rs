//! The replication engine.
//!
//! Consumes the decoded change stream, maintains the transaction envelope
//! (begin/type/relation preamble written lazily per participating table),
//! computes the cluster-wide safe flush LSN on every commit, and advances
//! the upstream slot only once the data behind an LSN is durable in the
//! archive.
//!
//! The structure splits in two: `StreamDispatcher` owns all per-message
//! and per-transaction state and is driven one payload at a time (which is
//! also how the tests drive it); `Engine` owns the connections and the
//! background tasks: the receive loop, the snapshot workers, the janitor.

use crate::backup::registry::TableRegistry;
use crate::backup::state::{NameHistory, StateStore};
use crate::backup::table::TableWriter;
use crate::common::{
    BackupError, BackupMetrics, Lsn, MessageKind, NamespacedName, Oid, Result, Shutdown, WorkQueue,
};
use crate::config::Config;
use crate::postgres::protocol::{
    CommitBody, PgOutputDecoder, PgOutputMessage, RelationBody, ReplicationClient,
    ReplicationFrame, ReplicationStream,
};
use crate::postgres::{ControlConnection, PostgresSnapshotExecutor, ReplicaIdentity, SnapshotExecutor};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often a standby status is reported when nothing else forces one.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(10);
/// Upper bound on a single replication-message wait.
pub const REPL_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const JANITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Mutable state owned by the receive loop. Single-writer: nothing outside
/// the dispatcher mutates it.
#[derive(Debug, Default)]
pub struct EngineState {
    /// LSN of the message currently being processed.
    pub current_lsn: Lsn,
    /// Commit LSN declared by the current transaction's begin record.
    pub tx_commit_lsn: Lsn,
    /// Upstream transaction id of the current transaction.
    pub tx_id: u32,
    /// Highest LSN durably flushed and safe to acknowledge upstream.
    /// Monotonic non-decreasing.
    pub latest_flush_lsn: Lsn,
    /// Commit LSN of the last transaction fully written out.
    pub last_committed_lsn: Lsn,
}

/// Decodes and applies one replication payload at a time.
pub struct StreamDispatcher {
    cfg: Config,
    registry: Arc<TableRegistry>,
    metrics: Arc<BackupMetrics>,
    state_store: StateStore,
    name_history: NameHistory,

    st: EngineState,
    tx_begin_raw: Option<Bytes>,
    tx_type_raw: Option<Bytes>,
    pending_relation_raw: HashMap<Oid, Bytes>,
    tx_participants: HashSet<Oid>,
    status_pending: bool,
}

impl StreamDispatcher {
    pub fn new(
        cfg: Config,
        registry: Arc<TableRegistry>,
        metrics: Arc<BackupMetrics>,
        state_store: StateStore,
    ) -> Self {
        Self {
            cfg,
            registry,
            metrics,
            state_store,
            name_history: NameHistory::new(),
            st: EngineState::default(),
            tx_begin_raw: None,
            tx_type_raw: None,
            pending_relation_raw: HashMap::new(),
            tx_participants: HashSet::new(),
            status_pending: false,
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.st
    }

    pub fn latest_flush_lsn(&self) -> Lsn {
        self.st.latest_flush_lsn
    }

    /// Adopt a flush LSN recovered at startup (state file or slot).
    pub fn adopt_flush_lsn(&mut self, lsn: Lsn) {
        self.st.latest_flush_lsn = lsn;
        self.metrics.set_flush_lsn(lsn);
    }

    /// Record a table name observed outside the change stream (startup
    /// enumeration); the commit LSN is not known yet.
    pub fn register_startup_name(&mut self, oid: Oid, name: &NamespacedName) {
        self.name_history.maybe_register(oid, name, Lsn::INVALID);
    }

    /// True once per flush advancement (or per commit when configured);
    /// the receive loop turns this into a standby status.
    pub fn take_status_pending(&mut self) -> bool {
        std::mem::take(&mut self.status_pending)
    }

    /// Apply one XLogData payload.
    pub async fn handle_xlog(&mut self, wal_start: Lsn, data: Bytes) -> Result<()> {
        self.st.current_lsn = wal_start;

        // Already flushed before a restart; the slot delivered it again
        // because its restart LSN had not advanced. Non-data messages come
        // with an invalid position and always pass.
        if wal_start.is_valid() && wal_start <= self.st.latest_flush_lsn {
            debug!(lsn = %wal_start, flushed = %self.st.latest_flush_lsn, "skipping replayed message");
            return Ok(());
        }

        let raw = data.clone();
        let mut buf = data;
        let msg = PgOutputDecoder::decode(&mut buf)?;
        self.handle_message(msg, raw).await
    }

    /// Apply one decoded message together with its raw payload.
    pub async fn handle_message(&mut self, msg: PgOutputMessage, raw: Bytes) -> Result<()> {
        match msg {
            PgOutputMessage::Begin(begin) => {
                self.st.tx_id = begin.xid;
                self.st.tx_commit_lsn = begin.final_lsn;
                self.tx_begin_raw = Some(raw);
                self.tx_participants.clear();
            }
            PgOutputMessage::Commit(commit) => self.process_commit(commit, raw).await?,
            PgOutputMessage::Relation(rel) => self.process_relation(rel, raw).await?,
            PgOutputMessage::Type(_) => {
                self.tx_type_raw = Some(raw);
            }
            PgOutputMessage::Insert(ins) => {
                self.process_dml(ins.oid, MessageKind::Insert, raw).await?
            }
            PgOutputMessage::Update(upd) => {
                self.process_dml(upd.oid, MessageKind::Update, raw).await?
            }
            PgOutputMessage::Delete(del) => {
                self.process_dml(del.oid, MessageKind::Delete, raw).await?
            }
            PgOutputMessage::Origin(_) | PgOutputMessage::Truncate(_) => {
                debug!("ignoring origin/truncate message");
            }
        }
        Ok(())
    }

    /// Act on a relation message: admit new tables (when configured),
    /// track renames, and stash the raw bytes until the table's next DML.
    async fn process_relation(&mut self, rel: RelationBody, raw: Bytes) -> Result<()> {
        if self.registry.get(rel.oid).is_none() {
            if !self.cfg.track_new_tables {
                debug!(oid = %rel.oid, table = %rel.name, "not tracking new table");
                return Ok(());
            }
            let writer = self.create_writer(rel.oid, rel.name.clone()).await?;
            info!(oid = %rel.oid, table = %writer.name(), "registered new table");
        }

        if self
            .name_history
            .maybe_register(rel.oid, &rel.name, self.st.tx_commit_lsn)
        {
            if let Some(writer) = self.registry.get(rel.oid) {
                writer.set_name(rel.name.clone());
            }
        }

        self.pending_relation_raw.insert(rel.oid, raw);
        Ok(())
    }

    /// Write a DML record, preceded by whatever of the transaction
    /// envelope this table has not seen yet: the begin, the pending type
    /// message, the pending relation message.
    async fn process_dml(&mut self, oid: Oid, kind: MessageKind, raw: Bytes) -> Result<()> {
        let Some(writer) = self.registry.get(oid) else {
            warn!(%oid, "received change for untracked table");
            return Ok(());
        };

        if !self.tx_participants.contains(&oid) {
            let begin = self
                .tx_begin_raw
                .clone()
                .ok_or_else(|| BackupError::protocol("DML before BEGIN"))?;
            self.write_record(&writer, &begin, MessageKind::Begin)
                .await?;
            self.tx_participants.insert(oid);
        }

        if let Some(type_raw) = self.tx_type_raw.take() {
            self.write_record(&writer, &type_raw, MessageKind::Type)
                .await?;
        }

        if let Some(rel_raw) = self.pending_relation_raw.remove(&oid) {
            self.write_record(&writer, &rel_raw, MessageKind::Relation)
                .await?;
        }

        self.write_record(&writer, &raw, kind).await
    }

    async fn process_commit(&mut self, commit: CommitBody, raw: Bytes) -> Result<()> {
        // The CopyData envelope LSN points past the commit; use the LSN
        // carried inside the commit record itself.
        self.st.current_lsn = commit.commit_lsn;

        let participants: Vec<Oid> = self.tx_participants.iter().copied().collect();
        for oid in participants {
            if let Some(writer) = self.registry.get(oid) {
                self.write_record(&writer, &raw, MessageKind::Commit)
                    .await?;
            }
        }

        if let Err(e) = self.flush_name_history_if_changed().await {
            warn!("could not flush the OID name map: {e}");
        }

        let candidate = self.next_flush_lsn();
        if candidate > self.st.latest_flush_lsn {
            self.st.latest_flush_lsn = candidate;
            self.metrics.set_flush_lsn(candidate);
            debug!(lsn = %candidate, "advanced flush LSN");
            if let Err(e) = self.state_store.write_restart_lsn(candidate).await {
                // Non-fatal: the slot simply does not advance this cycle.
                warn!("could not persist restart LSN: {e}");
            }
            self.status_pending = true;
        }
        if self.cfg.send_status_on_commit {
            self.status_pending = true;
        }

        self.st.last_committed_lsn = self.st.tx_commit_lsn;
        self.metrics.record_transaction(commit.timestamp);
        Ok(())
    }

    async fn write_record(
        &self,
        writer: &Arc<TableWriter>,
        raw: &Bytes,
        kind: MessageKind,
    ) -> Result<()> {
        let bytes = writer
            .write_delta(raw, self.st.tx_commit_lsn, self.st.current_lsn)
            .await?;
        self.metrics.record_message(kind, bytes);
        Ok(())
    }

    /// Minimum safe acknowledgement position across all writers.
    ///
    /// A writer with nothing unflushed is excluded, otherwise an idle
    /// table would pin the cluster's flush LSN forever; one with unflushed
    /// data caps the advance at its own durable position.
    fn next_flush_lsn(&self) -> Lsn {
        let mut safe = self.st.tx_commit_lsn;
        for writer in self.registry.snapshot() {
            let (flushed, needs_flush) = writer.get_flush_lsn();
            if needs_flush && flushed < safe {
                safe = flushed;
            }
        }
        safe
    }

    pub async fn flush_name_history_if_changed(&mut self) -> Result<()> {
        if !self.name_history.is_changed() {
            return Ok(());
        }
        self.state_store
            .write_name_history(&self.name_history)
            .await?;
        self.name_history.mark_clean();
        Ok(())
    }

    /// Graceful drain: rotate every writer, then advance the flush LSN to
    /// the last fully committed transaction and persist it. With all
    /// segments archived no writer caps the advance, so the result is
    /// deterministic.
    pub async fn finalize_shutdown(&mut self) -> Result<Lsn> {
        for writer in self.registry.snapshot() {
            if let Err(e) = writer.stop().await {
                warn!(table = %writer.oid(), "could not stop writer: {e}");
            }
        }

        if self.st.last_committed_lsn > self.st.latest_flush_lsn {
            self.st.latest_flush_lsn = self.st.last_committed_lsn;
            self.metrics.set_flush_lsn(self.st.latest_flush_lsn);
        }
        self.state_store
            .write_restart_lsn(self.st.latest_flush_lsn)
            .await?;
        Ok(self.st.latest_flush_lsn)
    }

    async fn create_writer(&self, oid: Oid, name: NamespacedName) -> Result<Arc<TableWriter>> {
        let writer = TableWriter::new(
            oid,
            name,
            self.cfg.staging_dir.clone(),
            self.cfg.archive_dir.clone(),
            self.cfg.deltas_per_file,
            self.cfg.fsync,
            Arc::clone(&self.metrics),
        )
        .await?;
        self.registry.insert(Arc::clone(&writer));
        Ok(writer)
    }
}

struct EngineShared {
    cfg: Config,
    registry: Arc<TableRegistry>,
    metrics: Arc<BackupMetrics>,
    queue: WorkQueue<Arc<TableWriter>>,
    shutdown: Shutdown,
    executor: Arc<dyn SnapshotExecutor>,
    failed: AtomicBool,
}

impl EngineShared {
    fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.shutdown.trigger();
    }

    /// Queue a snapshot unless one is already pending for the table.
    fn schedule_basebackup(&self, writer: Arc<TableWriter>) {
        if !writer.set_basebackup_pending() {
            return;
        }
        if !self.queue.put(Arc::clone(&writer)) {
            writer.clear_basebackup_pending();
            warn!(table = %writer.oid(), "snapshot queue full, will retry later");
        }
    }
}

/// The running engine: owns the replication stream and all workers.
pub struct Engine {
    shared: Arc<EngineShared>,
    stream: Option<ReplicationStream>,
    dispatcher: Option<StreamDispatcher>,
    send_initial_status: bool,
    handles: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Run the startup protocol: verify the publication, open or create
    /// the slot, recover the restart LSN, enumerate and prepare the
    /// published tables, and enter streaming mode.
    pub async fn bootstrap(cfg: Config, shutdown: Shutdown) -> Result<Engine> {
        tokio::fs::create_dir_all(&cfg.staging_dir).await?;
        tokio::fs::create_dir_all(&cfg.archive_dir).await?;

        let metrics = Arc::new(BackupMetrics::new());
        let registry = Arc::new(TableRegistry::new());
        let state_store = StateStore::new(&cfg.staging_dir, &cfg.archive_dir, cfg.fsync);

        let control = ControlConnection::connect(&cfg.db).await?;
        control.ensure_publication(&cfg.publication).await?;

        let slot_lsn = control.slot_flush_lsn(&cfg.slot_name).await?;
        let mut repl = ReplicationClient::connect(&cfg.db).await?;

        let (latest_flush_lsn, send_initial_status) = match slot_lsn {
            Some(confirmed) => {
                let adopted = match state_store.read_restart_lsn().await? {
                    Some(lsn) if lsn.is_valid() => {
                        info!(%lsn, "resuming from archived state file");
                        lsn
                    }
                    _ => {
                        info!(lsn = %confirmed, "no usable state file, resuming from slot position");
                        confirmed
                    }
                };
                // The final segment may have been flushed at shutdown
                // without advancing the slot; tell the server right away.
                (adopted, true)
            }
            None => {
                let consistent_point = match repl.create_slot(&cfg.slot_name).await {
                    Ok(lsn) => {
                        info!(slot = %cfg.slot_name, %lsn, "created replication slot");
                        lsn
                    }
                    Err(BackupError::SlotExists(_)) => {
                        // Lost the creation race; adopt whatever the winner
                        // left behind.
                        warn!(slot = %cfg.slot_name, "slot appeared concurrently, adopting it");
                        control
                            .slot_flush_lsn(&cfg.slot_name)
                            .await?
                            .ok_or_else(|| {
                                BackupError::replication("slot vanished after creation race")
                            })?
                    }
                    Err(e) => return Err(e),
                };
                let latest = consistent_point.saturating_prev();
                if let Err(e) = state_store.write_restart_lsn(latest).await {
                    warn!("could not store initial restart LSN: {e}");
                }
                (latest, false)
            }
        };

        let tables = control.publication_tables(&cfg.publication).await?;
        if tables.is_empty() && !cfg.track_new_tables {
            return Err(BackupError::config(format!(
                "publication {:?} contains no tables and new tables are not tracked",
                cfg.publication
            )));
        }

        let mut dispatcher = StreamDispatcher::new(
            cfg.clone(),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            state_store,
        );
        dispatcher.adopt_flush_lsn(latest_flush_lsn);

        for table in &tables {
            let target = ReplicaIdentity::target_for(table.has_pk, table.replica_identity);
            if target != table.replica_identity {
                control.set_replica_identity(&table.name, target).await?;
            }

            let writer = TableWriter::new(
                table.oid,
                table.name.clone(),
                cfg.staging_dir.clone(),
                cfg.archive_dir.clone(),
                cfg.deltas_per_file,
                cfg.fsync,
                Arc::clone(&metrics),
            )
            .await?;
            registry.insert(writer);
            dispatcher.register_startup_name(table.oid, &table.name);
        }
        info!(tables = registry.len(), "tracking published tables");

        if let Err(e) = dispatcher.flush_name_history_if_changed().await {
            warn!("could not flush the OID name map: {e}");
        }

        let stream = repl
            .start_replication(&cfg.slot_name, latest_flush_lsn, &cfg.publication)
            .await?;

        let queue = WorkQueue::new(16.max(registry.len() * 2), shutdown.clone());
        let executor: Arc<dyn SnapshotExecutor> =
            Arc::new(PostgresSnapshotExecutor::new(cfg.db.clone()));

        Ok(Engine {
            shared: Arc::new(EngineShared {
                cfg,
                registry,
                metrics,
                queue,
                shutdown,
                executor,
                failed: AtomicBool::new(false),
            }),
            stream: Some(stream),
            dispatcher: Some(dispatcher),
            send_initial_status,
            handles: Vec::new(),
        })
    }

    /// Spawn the receive loop, snapshot workers and the janitor.
    pub fn run(&mut self) {
        let (Some(stream), Some(dispatcher)) = (self.stream.take(), self.dispatcher.take())
        else {
            warn!("engine already running");
            return;
        };

        if self.shared.cfg.initial_basebackup {
            for writer in self.shared.registry.snapshot() {
                self.shared.schedule_basebackup(writer);
            }
        }

        let shared = Arc::clone(&self.shared);
        let initial_status = self.send_initial_status;
        self.handles.push(tokio::spawn(async move {
            stream_loop(shared, stream, dispatcher, initial_status).await;
        }));

        for i in 0..self.shared.cfg.concurrent_basebackups {
            let shared = Arc::clone(&self.shared);
            self.handles.push(tokio::spawn(async move {
                snapshot_worker(shared, i).await;
            }));
        }

        let shared = Arc::clone(&self.shared);
        self.handles.push(tokio::spawn(async move {
            janitor(shared).await;
        }));
    }

    /// Join every background task spawned by `run`.
    pub async fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("engine task panicked: {e}");
            }
        }
    }

    /// True when the engine stopped because of an error rather than a
    /// requested shutdown.
    pub fn failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> Arc<BackupMetrics> {
        Arc::clone(&self.shared.metrics)
    }
}

async fn stream_loop(
    shared: Arc<EngineShared>,
    mut stream: ReplicationStream,
    mut dispatcher: StreamDispatcher,
    send_initial_status: bool,
) {
    let mut listener = shared.shutdown.listen();

    if send_initial_status {
        if let Err(e) = send_status(&shared, &mut stream, dispatcher.latest_flush_lsn()).await {
            error!("could not send initial status: {e}");
            shared.fail();
        }
    }

    let mut last_status = Instant::now();
    loop {
        let mut force_status = false;

        tokio::select! {
            _ = listener.recv() => break,
            res = tokio::time::timeout(REPL_WAIT_TIMEOUT, stream.next_frame()) => {
                match res {
                    // Quiet stream; fall through to the status deadline.
                    Err(_elapsed) => {}
                    Ok(Ok(Some(ReplicationFrame::XLogData { wal_start, data, .. }))) => {
                        if let Err(e) = dispatcher.handle_xlog(wal_start, data).await {
                            error!("error handling WAL data: {e}");
                            shared.fail();
                            break;
                        }
                    }
                    Ok(Ok(Some(ReplicationFrame::Keepalive { reply_requested, .. }))) => {
                        if reply_requested {
                            debug!("server requested a standby status");
                            force_status = true;
                        }
                    }
                    Ok(Ok(None)) => {
                        error!("replication stream ended unexpectedly");
                        shared.fail();
                        break;
                    }
                    Ok(Err(e)) => {
                        error!("replication receive failed: {e}");
                        shared.fail();
                        break;
                    }
                }
            }
        }

        if force_status
            || dispatcher.take_status_pending()
            || last_status.elapsed() >= STATUS_INTERVAL
        {
            if let Err(e) = send_status(&shared, &mut stream, dispatcher.latest_flush_lsn()).await {
                error!("could not send standby status: {e}");
                shared.fail();
                break;
            }
            last_status = Instant::now();
        }
    }

    // Graceful drain: close every segment, persist the final position and
    // report it once more, best effort.
    match dispatcher.finalize_shutdown().await {
        Ok(final_lsn) => {
            let _ = stream.send_status(final_lsn).await;
            info!(flush_lsn = %final_lsn, "replication stream stopped");
        }
        Err(e) => warn!("could not persist final state: {e}"),
    }
    shared.shutdown.trigger();
}

async fn send_status(
    shared: &EngineShared,
    stream: &mut ReplicationStream,
    flush_lsn: Lsn,
) -> Result<()> {
    let window = shared.metrics.take_window();
    let megabytes = window.bytes as f64 / 1_048_576.0;
    info!(
        %flush_lsn,
        messages = window.messages,
        megabytes,
        "sending standby status"
    );
    stream.send_status(flush_lsn).await
}

async fn snapshot_worker(shared: Arc<EngineShared>, worker: usize) {
    loop {
        let writer = match shared.queue.get().await {
            Ok(writer) => writer,
            Err(_) => {
                debug!(worker, "snapshot worker stopping");
                return;
            }
        };

        debug!(worker, table = %writer.name(), "taking base snapshot");
        match writer.run_basebackup(shared.executor.as_ref()).await {
            Ok(()) => {}
            Err(BackupError::TableNotFound(name)) => {
                info!(table = %name, "table dropped upstream, retiring its writer");
                if let Err(e) = writer.stop().await {
                    warn!(table = %name, "could not stop writer: {e}");
                }
                shared.registry.remove(writer.oid());
            }
            Err(BackupError::Cancelled) => {}
            Err(e) => {
                // Left queued for the next schedule.
                warn!(table = %writer.name(), "base snapshot failed: {e}");
            }
        }
        writer.clear_basebackup_pending();
    }
}

/// One-second sweep over all writers: rotate idle segments and schedule
/// forced snapshots for tables that accumulated changes and then went
/// quiet.
async fn janitor(shared: Arc<EngineShared>) {
    let mut listener = shared.shutdown.listen();
    let mut tick = tokio::time::interval(JANITOR_INTERVAL);
    let archiver_timeout = shared.cfg.archiver_timeout();
    let force_interval = shared.cfg.force_basebackup_interval();

    loop {
        tokio::select! {
            _ = listener.recv() => return,
            _ = tick.tick() => {
                for writer in shared.registry.snapshot() {
                    if let Err(e) = writer.maybe_rotate_inactive(archiver_timeout).await {
                        warn!(table = %writer.oid(), "could not rotate idle segment: {e}");
                    }
                    if let Some(after) = force_interval {
                        if writer.messages_since_backup() > 0 && writer.inactive_for() >= after {
                            shared.schedule_basebackup(writer);
                        }
                    }
                }
            }
        }
    }
}
