//! PostgreSQL access: the replication wire protocol, catalog queries over
//! the control connection, and the COPY-based base-snapshot executor.

mod basebackup;
mod catalog;
pub mod protocol;

pub use basebackup::{PostgresSnapshotExecutor, SnapshotExecutor};
pub use catalog::{ControlConnection, PublicationTable, ReplicaIdentity};
