//! Process-wide shutdown token.
//!
//! A single broadcast-backed token that every background task selects on.
//! Any component may trigger it (signal handler, receive loop on a fatal
//! error, stream end); triggering is idempotent and observable by
//! listeners created after the fact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    fired: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal shutdown. Safe to call from any task, any number of times.
    pub fn trigger(&self) {
        self.fired.store(true, Ordering::SeqCst);
        // No receivers is fine; late listeners consult the flag.
        let _ = self.tx.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn listen(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
            fired: Arc::clone(&self.fired),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// One task's view of the shutdown token.
pub struct ShutdownListener {
    rx: broadcast::Receiver<()>,
    fired: Arc<AtomicBool>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been triggered. Returns immediately if it
    /// already was.
    pub async fn recv(&mut self) {
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        // A lag or closed-channel error still means the token fired.
        let _ = self.rx.recv().await;
    }
}
