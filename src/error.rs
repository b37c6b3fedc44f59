//! Error types for txjournal
//!
//! Resource exhaustion and torn transactions found during recovery are
//! absorbed inside the engine and never show up here. Device failures on
//! log or home writes and internal invariant violations halt the instance;
//! every mutating call after that returns [`JournalError::Halted`].

use thiserror::Error;

/// Result type alias using JournalError
pub type Result<T> = std::result::Result<T, JournalError>;

/// Unified error type for journal operations
#[derive(Debug, Error)]
pub enum JournalError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Consistency Errors
    // -------------------------------------------------------------------------
    /// The instance stopped accepting writes; remount to run recovery.
    #[error("journal halted: {0}")]
    Halted(String),

    #[error("journal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("journal corruption: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("invalid block {block}: {reason}")]
    InvalidBlock { block: u64, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for JournalError {
    fn from(err: bincode::Error) -> Self {
        JournalError::Serialization(err.to_string())
    }
}
