//! Error types for the snapshot engine.

use crate::report::Severity;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Enumeration error for source '{source_id}': {reason}")]
    Enumeration { source_id: String, reason: String },

    #[error("Object unreadable: {key}: {reason}")]
    ObjectUnreadable { key: String, reason: String },

    #[error("Packing error: {0}")]
    Packing(String),

    #[error("Corrupt container {path}: {reason}")]
    CorruptContainer { path: String, reason: String },

    #[error("Integrity error for {key}: {reason}")]
    Integrity { key: String, reason: String },

    #[error(
        "Ledger write failed for '{logical_name}': {reason}; \
         orphaned container {container} needs manual registration"
    )]
    LedgerWrite {
        logical_name: String,
        container: String,
        reason: String,
    },

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("A run is already in progress for '{0}'")]
    Busy(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Remote store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl EngineError {
    pub(crate) fn corrupt(path: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        EngineError::CorruptContainer {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// How bad this error is when it ends a run.
    pub fn severity(&self) -> Severity {
        match self {
            EngineError::Integrity { .. } => Severity::Integrity,
            EngineError::CorruptContainer { .. } => Severity::CorruptContainer,
            EngineError::Enumeration { .. } => Severity::Enumeration,
            EngineError::LedgerWrite { .. } | EngineError::Ledger(_) | EngineError::Database(_) => {
                Severity::Ledger
            }
            EngineError::Cancelled => Severity::Cancelled,
            EngineError::Config(_) | EngineError::Scheduler(_) => Severity::Config,
            EngineError::NotFound(_) | EngineError::Busy(_) => Severity::Unavailable,
            EngineError::ObjectUnreadable { .. } => Severity::Partial,
            EngineError::Packing(_)
            | EngineError::Store(_)
            | EngineError::Io(_)
            | EngineError::Serialization(_) => Severity::Fatal,
        }
    }
}

impl From<r2d2::Error> for EngineError {
    fn from(e: r2d2::Error) -> Self {
        EngineError::Ledger(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
