//! The backup core: engine, per-table writers, registry, and durable
//! state files.

mod engine;
mod registry;
pub mod state;
mod table;

pub use engine::{Engine, EngineState, StreamDispatcher, REPL_WAIT_TIMEOUT, STATUS_INTERVAL};
pub use registry::TableRegistry;
pub use state::{NameAtLsn, NameHistory, StateInfo, StateStore, OID_NAME_MAP_FILE, STATE_FILE};
pub use table::TableWriter;
