//! Error types for blockcache
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using CacheError
pub type Result<T> = std::result::Result<T, CacheError>;

/// Unified error type for blockcache operations
#[derive(Debug, Error)]
pub enum CacheError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Write would exceed the maximum file size")]
    CapacityExceeded,

    #[error("Entry not found")]
    NotFound,

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Structural corruption detected: {0}")]
    Corrupt(String),

    // -------------------------------------------------------------------------
    // Backend State Errors
    // -------------------------------------------------------------------------
    #[error("Cache backend is disabled")]
    Disabled,

    #[error("Configuration error: {0}")]
    Config(String),
}
