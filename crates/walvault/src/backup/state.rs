//! Durable engine state: the restart-LSN file and the OID→name map.
//!
//! Both files are small YAML documents written with the usual atomic
//! discipline (write a sibling temp file, fsync, rename, fsync the
//! directory) into the staging *and* archive directories, so either copy
//! alone is enough to recover.

use crate::common::{Lsn, NamespacedName, Oid, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const STATE_FILE: &str = "state.yaml";
pub const OID_NAME_MAP_FILE: &str = "oid2name.yaml";

/// Contents of `state.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInfo {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "currentLSN")]
    pub current_lsn: Lsn,
}

/// One entry of a table's name history: the name it carried starting at
/// the given commit LSN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameAtLsn {
    pub name: NamespacedName,
    pub lsn: Lsn,
}

/// In-memory OID→name history with a dirty bit.
///
/// Histories are append-only and strictly LSN-ordered; an entry is added
/// only when the observed name differs from the latest recorded one.
#[derive(Debug, Default)]
pub struct NameHistory {
    history: HashMap<Oid, Vec<NameAtLsn>>,
    changed: bool,
}

impl NameHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `name` for `oid` as of `lsn` unless it is already current.
    /// Returns true when an entry was appended.
    pub fn maybe_register(&mut self, oid: Oid, name: &NamespacedName, lsn: Lsn) -> bool {
        let entries = self.history.entry(oid).or_default();
        if entries.last().map(|e| &e.name) == Some(name) {
            return false;
        }
        entries.push(NameAtLsn {
            name: name.clone(),
            lsn,
        });
        self.changed = true;
        true
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn mark_clean(&mut self) {
        self.changed = false;
    }

    pub fn entries(&self) -> &HashMap<Oid, Vec<NameAtLsn>> {
        &self.history
    }

    pub fn current_name(&self, oid: Oid) -> Option<&NamespacedName> {
        self.history.get(&oid).and_then(|v| v.last()).map(|e| &e.name)
    }
}

/// Writes and reads the two state files.
#[derive(Debug, Clone)]
pub struct StateStore {
    staging_dir: PathBuf,
    archive_dir: PathBuf,
    fsync: bool,
}

impl StateStore {
    pub fn new(staging_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            archive_dir: archive_dir.into(),
            fsync,
        }
    }

    /// The LSN to restart streaming from, read from the archive copy.
    /// `None` when no state file exists yet.
    pub async fn read_restart_lsn(&self) -> Result<Option<Lsn>> {
        let path = self.archive_dir.join(STATE_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let info: StateInfo = serde_yaml::from_str(&raw)?;
        Ok(Some(info.current_lsn))
    }

    /// Persist the restart LSN to both directories.
    pub async fn write_restart_lsn(&self, lsn: Lsn) -> Result<()> {
        let info = StateInfo {
            timestamp: Utc::now(),
            current_lsn: lsn,
        };
        self.write_both(STATE_FILE, &info).await?;
        debug!(%lsn, "persisted restart LSN");
        Ok(())
    }

    /// Persist the OID→name history to both directories.
    pub async fn write_name_history(&self, history: &NameHistory) -> Result<()> {
        self.write_both(OID_NAME_MAP_FILE, history.entries()).await
    }

    async fn write_both<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        write_yaml_atomic(&self.staging_dir, file, value, self.fsync).await?;
        write_yaml_atomic(&self.archive_dir, file, value, self.fsync).await
    }
}

async fn write_yaml_atomic<T: Serialize>(
    dir: &Path,
    file: &str,
    value: &T,
    fsync: bool,
) -> Result<()> {
    let final_path = dir.join(file);
    let tmp_path = dir.join(format!("{file}.tmp"));

    let raw = serde_yaml::to_string(value)?;
    let mut f = tokio::fs::File::create(&tmp_path).await?;
    f.write_all(raw.as_bytes()).await?;
    f.flush().await?;
    if fsync {
        f.sync_all().await?;
    }
    drop(f);

    tokio::fs::rename(&tmp_path, &final_path).await?;
    if fsync {
        sync_dir(dir).await?;
    }
    Ok(())
}

/// Make a rename durable by fsyncing the containing directory.
pub async fn sync_dir(dir: &Path) -> Result<()> {
    let dir = tokio::fs::File::open(dir).await?;
    dir.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(staging: &TempDir, archive: &TempDir) -> StateStore {
        StateStore::new(staging.path(), archive.path(), true)
    }

    #[tokio::test]
    async fn restart_lsn_round_trips() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let store = store(&staging, &archive);

        assert_eq!(store.read_restart_lsn().await.unwrap(), None);

        store.write_restart_lsn(Lsn(0x500)).await.unwrap();
        assert_eq!(store.read_restart_lsn().await.unwrap(), Some(Lsn(0x500)));

        // both copies exist and agree
        for dir in [staging.path(), archive.path()] {
            let raw = std::fs::read_to_string(dir.join(STATE_FILE)).unwrap();
            let info: StateInfo = serde_yaml::from_str(&raw).unwrap();
            assert_eq!(info.current_lsn, Lsn(0x500));
            assert!(raw.contains("currentLSN"));
        }
    }

    #[tokio::test]
    async fn state_file_codec_preserves_fields() {
        let info = StateInfo {
            timestamp: Utc::now(),
            current_lsn: Lsn(0xAB_DEAD_BEEF),
        };
        let raw = serde_yaml::to_string(&info).unwrap();
        let back: StateInfo = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(back, info);
    }

    #[tokio::test]
    async fn name_history_appends_only_on_change() {
        let mut history = NameHistory::new();
        let users = NamespacedName::new("public", "users");
        let people = NamespacedName::new("public", "people");

        assert!(history.maybe_register(Oid(16384), &users, Lsn::INVALID));
        assert!(history.is_changed());
        history.mark_clean();

        // same name again: no entry, no dirt
        assert!(!history.maybe_register(Oid(16384), &users, Lsn(0x100)));
        assert!(!history.is_changed());

        // rename: appended with the commit LSN
        assert!(history.maybe_register(Oid(16384), &people, Lsn(0x300)));
        let entries = &history.entries()[&Oid(16384)];
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].lsn, Lsn::INVALID);
        assert_eq!(entries[1].name, people);
        assert_eq!(entries[1].lsn, Lsn(0x300));
        assert_eq!(history.current_name(Oid(16384)), Some(&people));
    }

    #[tokio::test]
    async fn name_history_file_round_trips() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let store = store(&staging, &archive);

        let mut history = NameHistory::new();
        history.maybe_register(
            Oid(16384),
            &NamespacedName::new("public", "t"),
            Lsn::INVALID,
        );
        history.maybe_register(Oid(16384), &NamespacedName::new("public", "u"), Lsn(0x300));
        history.maybe_register(Oid(16400), &NamespacedName::new("audit", "log"), Lsn(0x200));

        store.write_name_history(&history).await.unwrap();

        let raw = std::fs::read_to_string(archive.path().join(OID_NAME_MAP_FILE)).unwrap();
        let back: HashMap<Oid, Vec<NameAtLsn>> = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(&back, history.entries());
        assert!(raw.contains("public.u"));
        assert!(raw.contains("0/300"));

        // staging copy matches
        let raw_staging = std::fs::read_to_string(staging.path().join(OID_NAME_MAP_FILE)).unwrap();
        assert_eq!(raw, raw_staging);
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let store = store(&staging, &archive);

        store.write_restart_lsn(Lsn(1)).await.unwrap();
        store.write_restart_lsn(Lsn(2)).await.unwrap();

        for dir in [staging.path(), archive.path()] {
            let leftovers: Vec<_> = std::fs::read_dir(dir)
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
                .collect();
            assert!(leftovers.is_empty());
        }
        assert_eq!(store.read_restart_lsn().await.unwrap(), Some(Lsn(2)));
    }
}
