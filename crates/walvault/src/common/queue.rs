//! Bounded work queue for base-snapshot scheduling.
//!
//! `put` never blocks: when the queue is full the item is rejected and the
//! caller decides what to do (the scheduler releases the table's pending
//! flag and retries on a later sweep). `get` blocks until an item arrives
//! or the shutdown token fires.

use crate::common::{BackupError, Result, Shutdown};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

pub struct WorkQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    shutdown: Shutdown,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize, shutdown: Shutdown) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            shutdown,
        }
    }

    /// Non-blocking enqueue. Returns false when the queue is full.
    pub fn put(&self, item: T) -> bool {
        self.tx.try_send(item).is_ok()
    }

    /// Dequeue the next item, waiting as long as it takes.
    ///
    /// Returns `BackupError::Cancelled` once shutdown has been triggered.
    pub async fn get(&self) -> Result<T> {
        let mut listener = self.shutdown.listen();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = listener.recv() => Err(BackupError::Cancelled),
            item = rx.recv() => item.ok_or(BackupError::Cancelled),
        }
    }
}
