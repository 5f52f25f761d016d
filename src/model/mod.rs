//! Core data model types: stored entries and decoded messages.

pub mod entry;
pub mod message;

pub use entry::MessageEntry;
pub use message::{Attachment, StructuredMessage};
