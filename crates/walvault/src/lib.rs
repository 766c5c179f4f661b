//! # walvault: durable logical-replication backups for PostgreSQL
//!
//! walvault owns a logical replication slot, consumes the pgoutput change
//! stream of one publication, and turns it into a replayable on-disk
//! backup: per-table delta segments written in a staging directory and
//! rotated into an archive, anchored by periodic per-table base snapshots.
//!
//! The engine reconciles three independent progress axes (the upstream
//! WAL position, each table's durably flushed position, and each table's
//! base-snapshot position) and never acknowledges an LSN upstream unless
//! everything at or below it is safely in the archive.
//!
//! ## Architecture
//!
//! ```text
//! PostgreSQL WAL → ReplicationClient → PgOutputDecoder → StreamDispatcher
//!                                                            │
//!                               ┌────────────────────────────┼──────────────┐
//!                               ▼                            ▼              ▼
//!                        TableWriter (per OID)        OID→name history   snapshot queue
//!                        staging/<oid>/*.delta        oid2name.yaml         │
//!                               │                                           ▼
//!                               └── fsync + rename ──► archive/      snapshot workers
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use walvault::{Config, Engine, Shutdown};
//!
//! # async fn example() -> walvault::Result<()> {
//! let config = Config::from_file("walvault.yaml")?;
//! let shutdown = Shutdown::new();
//!
//! let mut engine = Engine::bootstrap(config, shutdown.clone()).await?;
//! engine.run();
//! // ... trigger `shutdown` on SIGINT/SIGTERM ...
//! engine.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod common;
pub mod config;
pub mod postgres;

pub use backup::{Engine, StreamDispatcher, TableRegistry, TableWriter};
pub use common::{
    BackupError, BackupMetrics, Lsn, MessageKind, NamespacedName, Oid, Result, Shutdown,
};
pub use config::{Config, DbConfig};
