//! Error types for the backup engine.

use thiserror::Error;

/// Errors produced anywhere in the backup pipeline.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Error from the non-replication control connection
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Replication transport error
    #[error("replication error: {0}")]
    Replication(String),

    /// A message the decoder could not parse
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// State or map file (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The table was dropped upstream; its writer must be retired
    #[error("table {0} not found upstream")]
    TableNotFound(String),

    /// Slot creation lost a race against another consumer
    #[error("replication slot {0} already exists")]
    SlotExists(String),

    /// The shutdown token fired while waiting
    #[error("operation cancelled")]
    Cancelled,

    /// An operation was attempted in a state that cannot support it
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl BackupError {
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// True when the error means the whole process should stop.
    ///
    /// Snapshot failures for individual tables and cancellations are
    /// handled locally; everything else tears the engine down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TableNotFound(_) | Self::Cancelled)
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = BackupError::replication("connection reset");
        assert!(err.to_string().contains("replication error"));
        assert!(err.to_string().contains("connection reset"));

        let err = BackupError::TableNotFound("public.users".into());
        assert!(err.to_string().contains("public.users"));
    }

    #[test]
    fn fatality_classification() {
        assert!(BackupError::protocol("bad tag").is_fatal());
        assert!(BackupError::config("missing slot").is_fatal());
        assert!(!BackupError::TableNotFound("t".into()).is_fatal());
        assert!(!BackupError::Cancelled.is_fatal());
    }
}
