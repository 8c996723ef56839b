//! Error types for CradleKV
//!
//! Provides a unified error type for routing, storage and lifecycle
//! operations. Every variant maps onto one wire status (see
//! [`crate::protocol::Status`]).

use thiserror::Error;

use crate::protocol::Status;

/// Result type alias using CradleError
pub type Result<T> = std::result::Result<T, CradleError>;

/// Unified error type for CradleKV operations
#[derive(Debug, Error)]
pub enum CradleError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Request Errors
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    NotFound,

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Key outside of range owned by {router}")]
    RangeMismatch { router: String },

    #[error("Routing loop: hop count {hops} exceeds bound {bound}")]
    RoutingLoop { hops: u8, bound: u8 },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("No owner for key range: {0}")]
    Unavailable(String),

    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    #[error("Connection failure to {addr} after {attempts} attempt(s): {reason}")]
    ConnectionFailure {
        addr: String,
        attempts: u32,
        reason: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Topology Errors
    // -------------------------------------------------------------------------
    #[error("Range conflict: {0}")]
    RangeConflict(String),

    #[error("Migration conflict: {0}")]
    MigrationConflict(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Log corruption detected: {0}")]
    LogCorruption(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration / Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutting down")]
    Shutdown,

    /// Non-OK response relayed from another router or host
    #[error("Remote {status:?}: {message}")]
    Remote { status: Status, message: String },
}

impl From<bincode::Error> for CradleError {
    fn from(err: bincode::Error) -> Self {
        CradleError::Serialization(err.to_string())
    }
}
