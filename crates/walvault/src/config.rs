//! Daemon configuration.
//!
//! Loaded from a single YAML file. Keys are camelCase to match the file
//! format the operators already have; durations are plain integers
//! (seconds, except where noted).

use crate::common::{BackupError, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// PostgreSQL identifiers are limited to NAMEDATALEN - 1 bytes.
const PG_MAX_IDENTIFIER_LEN: usize = 63;

/// Connection parameters for the upstream server.
#[derive(Clone, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    pub dbname: String,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Redact the password so it cannot leak into logs.
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field(
                "password",
                &self.password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("dbname", &self.dbname)
            .finish()
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

/// Full daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub db: DbConfig,
    pub slot_name: String,
    pub publication: String,
    pub staging_dir: PathBuf,
    pub archive_dir: PathBuf,

    /// Segment rotation by record count.
    #[serde(default = "default_deltas_per_file")]
    pub deltas_per_file: u32,

    /// Segment rotation by inactivity, seconds.
    #[serde(default = "default_archiver_timeout")]
    pub archiver_timeout: u64,

    /// Number of concurrent base-snapshot workers.
    #[serde(default = "default_concurrent_basebackups")]
    pub concurrent_basebackups: usize,

    /// Admit relations not present in the publication at startup.
    #[serde(default)]
    pub track_new_tables: bool,

    /// Queue a snapshot of every table on first start.
    #[serde(default)]
    pub initial_basebackup: bool,

    /// Send a standby status on every commit, not only on the ticker.
    #[serde(default)]
    pub send_status_on_commit: bool,

    /// Enforce durable fsync; when off, rely on the OS page cache.
    #[serde(default = "default_true")]
    pub fsync: bool,

    /// Schedule a snapshot when a table with pending changes has been
    /// quiet for this many minutes. Values below one minute are raised
    /// to one.
    #[serde(default)]
    pub force_basebackup_after_inactivity_interval: Option<u64>,
}

fn default_deltas_per_file() -> u32 {
    100
}

fn default_archiver_timeout() -> u64 {
    180
}

fn default_concurrent_basebackups() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BackupError::config(format!(
                "could not read config file {:?}: {e}",
                path.as_ref()
            ))
        })?;
        let cfg: Config = serde_yaml::from_str(&raw)
            .map_err(|e| BackupError::config(format!("could not decode config file: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier("slotName", &self.slot_name)?;
        validate_identifier("publication", &self.publication)?;
        if self.db.user.is_empty() {
            return Err(BackupError::config("db.user is required"));
        }
        if self.db.dbname.is_empty() {
            return Err(BackupError::config("db.dbname is required"));
        }
        if self.staging_dir.as_os_str().is_empty() {
            return Err(BackupError::config("stagingDir is required"));
        }
        if self.archive_dir.as_os_str().is_empty() {
            return Err(BackupError::config("archiveDir is required"));
        }
        if self.staging_dir == self.archive_dir {
            return Err(BackupError::config(
                "stagingDir and archiveDir must be distinct",
            ));
        }
        if self.deltas_per_file == 0 {
            return Err(BackupError::config("deltasPerFile must be at least 1"));
        }
        if self.concurrent_basebackups == 0 {
            return Err(BackupError::config(
                "concurrentBasebackups must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn archiver_timeout(&self) -> Duration {
        Duration::from_secs(self.archiver_timeout)
    }

    /// Forced-snapshot inactivity interval, truncated to whole minutes
    /// with a one-minute floor.
    pub fn force_basebackup_interval(&self) -> Option<Duration> {
        self.force_basebackup_after_inactivity_interval
            .map(|minutes| Duration::from_secs(minutes.max(1) * 60))
    }
}

fn validate_identifier(key: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(BackupError::config(format!("{key} is required")));
    }
    if value.len() > PG_MAX_IDENTIFIER_LEN {
        return Err(BackupError::config(format!(
            "{key} exceeds the PostgreSQL identifier limit of {PG_MAX_IDENTIFIER_LEN} bytes (got {})",
            value.len()
        )));
    }
    Ok(())
}
