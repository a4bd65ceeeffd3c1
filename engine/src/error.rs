//! Error types for the paysync engine.
//!
//! The taxonomy mirrors how failures propagate through a sync cycle:
//! per-record errors ([`Error::Validation`], [`Error::Transient`],
//! [`Error::Timeout`], [`Error::Conflict`]) are collected and the pipeline
//! keeps going, while fatal errors ([`Error::Auth`], [`Error::AlreadySyncing`])
//! end the cycle at the point they occur.

use crate::{RecordId, TableName};
use thiserror::Error;

/// All possible errors from the paysync engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Per-record errors
    #[error("validation failed for {table}/{id}: {reason}")]
    Validation {
        table: TableName,
        id: RecordId,
        reason: String,
    },

    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("remote call timed out after {0} ms")]
    Timeout(u64),

    #[error("conflict on {table}/{id}: {reason}")]
    Conflict {
        table: TableName,
        id: RecordId,
        reason: String,
    },

    // Fatal errors
    #[error("no authenticated remote session: {0}")]
    Auth(String),

    #[error("a sync cycle is already in progress")]
    AlreadySyncing,

    // Configuration and registry errors
    #[error("table not declared in registry: {0}")]
    UnknownTable(TableName),

    #[error("dependency cycle between entity types: {0}")]
    DependencyCycle(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Local storage errors
    #[error("local store error: {0}")]
    Store(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Fatal errors abort the whole cycle instead of being collected per record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::AlreadySyncing)
    }

    /// Whether the same remote call may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Timeout(_))
    }

    /// Shorthand for a validation error on a specific record.
    pub fn validation(
        table: impl Into<TableName>,
        id: impl Into<RecordId>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Validation {
            table: table.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidSnapshot(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
