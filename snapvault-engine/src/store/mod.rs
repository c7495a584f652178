//! Remote object directory seam.
//!
//! The engine only ever talks to a store through [`ObjectDirectory`]:
//! enumerate a collection, stream one object out, stream one object in.
//! Anything that can do those three things and hand back stable version
//! identifiers can be backed up and restored.

pub mod files;
pub mod fs;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use files::FileListDirectory;
pub use fs::FsDirectory;
pub use memory::MemoryDirectory;

/// Owned byte stream flowing in or out of a store.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// One object as seen at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObjectRef {
    pub logical_key: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub remote_version_id: String,
}

/// Content of one object plus the revision it was read at.
pub struct ObjectBody {
    pub remote_version_id: String,
    pub reader: ByteStream,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("remote_version_id", &self.remote_version_id)
            .finish_non_exhaustive()
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// Timeouts, throttling and other conditions worth retrying.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient(_) => true,
            StoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::WouldBlock
            ),
            StoreError::NotFound(_)
            | StoreError::InvalidKey { .. }
            | StoreError::Unsupported(_)
            | StoreError::Other(_) => false,
        }
    }
}

#[async_trait]
pub trait ObjectDirectory: Send + Sync {
    /// Enumerate every object under `source` (a key prefix; empty = all).
    async fn list(&self, source: &str) -> Result<Vec<RemoteObjectRef>, StoreError>;

    /// Open an object for streaming.
    async fn read(&self, logical_key: &str) -> Result<ObjectBody, StoreError>;

    /// Store `body` under `logical_key`, returning the new version identifier.
    async fn write(&self, logical_key: &str, body: ByteStream) -> Result<String, StoreError>;

    /// Remove an object. Deleting a missing key succeeds.
    async fn delete(&self, logical_key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unsupported(format!("delete {}", logical_key)))
    }
}

/// Reject keys that could escape a namespace or are unusable as object names.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| {
        Err(StoreError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        })
    };

    if key.is_empty() {
        return invalid("empty key");
    }
    if key.len() > u16::MAX as usize {
        return invalid("key longer than 65535 bytes");
    }
    if key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return invalid("absolute path or forbidden character");
    }
    if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return invalid("empty, '.' or '..' path segment");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("a.txt").is_ok());
        assert!(validate_key("docs/2024/report.pdf").is_ok());

        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("dir/").is_err());
        assert!(validate_key("win\\path").is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Transient("throttled".into()).is_transient());
        assert!(StoreError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_transient());
        assert!(!StoreError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)).is_transient());
        assert!(!StoreError::NotFound("k".into()).is_transient());
    }
}
