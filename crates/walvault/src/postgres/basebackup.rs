//! Per-table base snapshots.
//!
//! A snapshot is a consistent, point-in-time copy of one whole table taken
//! out-of-band from the change stream. The executor trait is the seam the
//! snapshot workers are tested through; the PostgreSQL implementation
//! streams `COPY ... TO STDOUT` inside a repeatable-read transaction.

use crate::common::{BackupError, NamespacedName, Result};
use crate::config::DbConfig;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::{debug, error};

/// Produces the snapshot byte stream for one table.
#[async_trait]
pub trait SnapshotExecutor: Send + Sync {
    /// Copy the table's current contents into `dest`.
    ///
    /// Returns the number of bytes written. Must report
    /// `BackupError::TableNotFound` when the table no longer exists
    /// upstream; the caller retires the table on that signal.
    async fn copy_table(&self, table: &NamespacedName, dest: &mut tokio::fs::File) -> Result<u64>;
}

/// COPY-based snapshot executor.
///
/// Opens a fresh connection per snapshot so long-running copies never
/// starve the control connection.
pub struct PostgresSnapshotExecutor {
    db: DbConfig,
}

impl PostgresSnapshotExecutor {
    pub fn new(db: DbConfig) -> Self {
        Self { db }
    }

    async fn connect(&self) -> Result<tokio_postgres::Client> {
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&self.db.host)
            .port(self.db.port)
            .user(&self.db.user)
            .dbname(&self.db.dbname)
            .application_name("walvault-basebackup");
        if let Some(password) = &self.db.password {
            cfg.password(password);
        }

        let (client, connection) = cfg.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("basebackup connection error: {e}");
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl SnapshotExecutor for PostgresSnapshotExecutor {
    async fn copy_table(&self, table: &NamespacedName, dest: &mut tokio::fs::File) -> Result<u64> {
        let client = self.connect().await?;

        client
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await?;

        let stream = client
            .copy_out(&format!("COPY {} TO STDOUT", table.sanitized()))
            .await
            .map_err(|e| classify_copy_error(table, e))?;
        futures::pin_mut!(stream);

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_copy_error(table, e))?;
            dest.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        client.batch_execute("COMMIT").await?;
        debug!(table = %table, bytes = written, "table snapshot complete");
        Ok(written)
    }
}

fn classify_copy_error(table: &NamespacedName, e: tokio_postgres::Error) -> BackupError {
    if e.code() == Some(&SqlState::UNDEFINED_TABLE) {
        BackupError::TableNotFound(table.to_string())
    } else {
        BackupError::Postgres(e)
    }
}
