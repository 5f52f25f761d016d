//! Centralized error types for Papercut.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// All errors produced by the Papercut library.
#[derive(Error, Debug)]
pub enum PapercutError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The listener could not acquire its socket (address in use, permission denied).
    ///
    /// Recoverable: the operator has to pick another address or port.
    #[error("Failed to bind SMTP listener to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// `start` was called on a listener that is already accepting connections.
    #[error("SMTP listener is already bound to {0}")]
    AlreadyBound(SocketAddr),

    /// The payload could not be decoded into a structured message.
    ///
    /// The entry stays in the store; only its preview is unavailable.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A path was registered twice with the message store.
    #[error("Message already registered: {0}")]
    DuplicateEntry(PathBuf),

    /// The SMTP client violated the dialogue. Scoped to a single connection.
    #[error("SMTP protocol error: {0}")]
    Protocol(String),

    /// The work was superseded. Never shown to the user.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Convenience alias for `Result<T, PapercutError>`.
pub type Result<T> = std::result::Result<T, PapercutError>;

impl PapercutError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// `true` for the expected outcome of superseded work.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// `true` when the underlying cause is a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare; prefer `PapercutError::io`).
impl From<std::io::Error> for PapercutError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
