//! Shared plumbing: identifiers, errors, metrics, and the shutdown token.

mod error;
mod lsn;
mod metrics;
mod queue;
mod shutdown;
mod types;

pub use error::{BackupError, Result};
pub use lsn::{Lsn, ParseLsnError};
pub use metrics::{BackupMetrics, MessageKind, MetricsSnapshot, WindowStats};
pub use queue::WorkQueue;
pub use shutdown::{Shutdown, ShutdownListener};
pub use types::{NamespacedName, Oid};
