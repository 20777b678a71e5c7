//! Error taxonomy shared by every component of the cache server.

use std::io;

/// A tagged I/O failure, carrying the operation that was attempted so log
/// lines and error frames can say e.g. `mmap` or `resize` instead of a bare
/// `std::io::Error`.
#[derive(Debug, thiserror::Error)]
#[error("{op} failed: {source}")]
pub struct TaggedIoError {
    pub op: &'static str,
    #[source]
    pub source: io::Error,
}

impl TaggedIoError {
    pub fn new(op: &'static str, source: io::Error) -> Self {
        Self { op, source }
    }
}

/// The error taxonomy from the protocol's error handling design. `Display`
/// messages are written to match the literal strings the wire protocol
/// emits, so handler code can turn one of these directly into an ERROR
/// frame's `message` field with `.to_string()`.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Stream not found: {0}")]
    NotFound(String),

    #[error("Stream already exists: {0}")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] TaggedIoError),

    #[error("{0}")]
    Protocol(String),
}

impl ServerError {
    pub fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io(TaggedIoError::new(op, source))
    }

    /// True for faults that should move an owning stream into `ERROR`
    /// status rather than just being reported back to the caller.
    pub fn is_fault(&self) -> bool {
        matches!(self, ServerError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
