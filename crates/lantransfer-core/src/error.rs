//! Error types for the transfer engine.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Errors surfaced by the transfer engine.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The source path handed to a send call does not exist.
    #[error("path not found: {0}")]
    NotFound(PathBuf),

    /// Transport failure before any chunk succeeded.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The receiver rejected a chunk and retries were exhausted.
    #[error("chunk rejected: {0}")]
    ChunkRejected(String),

    /// The received bytes did not hash to the declared digest.
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },

    /// Finalization was requested before all bytes arrived.
    #[error("incomplete transfer: received {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    /// The transfer was cancelled cooperatively.
    #[error("transfer cancelled")]
    Cancelled,

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
