//! Concurrent OID → writer registry.
//!
//! Readers that need to visit every writer (the flush-LSN computation, the
//! janitor sweep) take a snapshot of the current set and iterate outside
//! the lock, so removal never observes a half-retired writer mid-visit.

use crate::backup::table::TableWriter;
use crate::common::Oid;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
pub struct TableRegistry {
    inner: RwLock<HashMap<Oid, Arc<TableWriter>>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, oid: Oid) -> Option<Arc<TableWriter>> {
        self.inner
            .read()
            .expect("table registry poisoned")
            .get(&oid)
            .cloned()
    }

    pub fn insert(&self, writer: Arc<TableWriter>) {
        self.inner
            .write()
            .expect("table registry poisoned")
            .insert(writer.oid(), writer);
    }

    pub fn remove(&self, oid: Oid) -> Option<Arc<TableWriter>> {
        self.inner
            .write()
            .expect("table registry poisoned")
            .remove(&oid)
    }

    /// Clone out the current set of writers for lock-free iteration.
    pub fn snapshot(&self) -> Vec<Arc<TableWriter>> {
        self.inner
            .read()
            .expect("table registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("table registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BackupMetrics, NamespacedName};
    use tempfile::TempDir;

    async fn writer(oid: u32, dir: &TempDir) -> Arc<TableWriter> {
        TableWriter::new(
            Oid(oid),
            NamespacedName::new("public", format!("t{oid}")),
            dir.path().join("staging"),
            dir.path().join("archive"),
            4,
            true,
            Arc::new(BackupMetrics::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let dir = TempDir::new().unwrap();
        let registry = TableRegistry::new();
        assert!(registry.is_empty());

        let w = writer(16384, &dir).await;
        registry.insert(w.clone());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(Oid(16384)).unwrap().oid(), Oid(16384));
        assert!(registry.get(Oid(1)).is_none());

        let removed = registry.remove(Oid(16384)).unwrap();
        assert_eq!(removed.oid(), Oid(16384));
        assert!(registry.get(Oid(16384)).is_none());
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_mutation() {
        let dir = TempDir::new().unwrap();
        let registry = TableRegistry::new();
        registry.insert(writer(1, &dir).await);
        registry.insert(writer(2, &dir).await);

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 2);

        registry.remove(Oid(1));
        // the snapshot still holds both writers; the registry does not
        assert_eq!(snap.len(), 2);
        assert_eq!(registry.len(), 1);
    }
}
