//! Error types for repfs

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Protocol Errors ===
    #[error("malformed command line: {0}")]
    Protocol(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    // === Capacity & Conflict Errors ===
    #[error("fewer storage nodes joined than the replication factor")]
    NotEnoughNodes,

    #[error("file already exists: {0}")]
    FileAlreadyExists(String),

    #[error("file does not exist: {0}")]
    FileNotFound(String),

    #[error("load failed after trying {attempts} nodes")]
    LoadFailed { attempts: usize },

    // === Storage Errors ===
    #[error("corrupted blob: {0}")]
    Corrupted(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    // === Timeout Errors ===
    #[error("operation timeout: {0}")]
    Timeout(String),

    // === Config Errors ===
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionClosed | Error::NotEnoughNodes
        )
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
