//! Message storage: the registry of captured files and the spool that writes them.

pub mod registry;
pub mod spool;

pub use registry::{scan_existing, MessageStore, Snapshot, StoreEvent};
pub use spool::IncomingMessage;
