//! Error types for ShardKV
//!
//! Provides a unified error type for all operations. Lookup outcomes
//! (found / tombstone / not found) are not errors; see [`crate::memtable::Lookup`].

use thiserror::Error;

use crate::config::Protection;

/// Result type alias using ShardError
pub type Result<T> = std::result::Result<T, ShardError>;

/// Unified error type for ShardKV operations
#[derive(Debug, Error)]
pub enum ShardError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Access Errors
    // -------------------------------------------------------------------------
    #[error("{op} not permitted under {protection:?} protection")]
    ProtectionViolation {
        op: &'static str,
        protection: Protection,
    },

    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    #[error("Update function {0} already registered")]
    DuplicateUpdateFn(i32),

    #[error("Update function {0} is not registered")]
    UnknownUpdateFn(i32),

    #[error("Unknown database id {0}")]
    UnknownDatabase(u64),

    #[error("Unknown event {0}")]
    UnknownEvent(u64),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Worker has shut down")]
    Shutdown,
}
