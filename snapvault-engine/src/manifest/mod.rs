//! Snapshot manifests.
//!
//! A manifest is the authoritative description of one snapshot: which keys
//! it covers, the digest and size of each, and the remote version observed
//! when the collection was enumerated. Keys that could not be read are kept
//! alongside as failure records so a partial run is never silent.

pub mod builder;
pub mod checksum;

use checksum::Checksum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use builder::ManifestBuilder;

/// Digest and metadata for a single object in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub logical_key: String,
    pub checksum: Checksum,
    pub size_bytes: u64,
    pub remote_version_id: String,
}

/// A key that was enumerated but could not be captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub logical_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Time-ordered unique identifier (UUID v7)
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub source: String,
    /// Successful entries, ordered by logical key
    pub entries: Vec<ManifestEntry>,
    pub failures: Vec<FailedEntry>,
}

impl Manifest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            snapshot_id: uuid::Uuid::now_v7().to_string(),
            created_at: Utc::now(),
            source: source.into(),
            entries: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failed_keys(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.logical_key.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, data: &[u8]) -> ManifestEntry {
        ManifestEntry {
            logical_key: key.to_string(),
            checksum: Checksum::of(data),
            size_bytes: data.len() as u64,
            remote_version_id: "v1".to_string(),
        }
    }

    #[test]
    fn test_totals_and_partial() {
        let mut manifest = Manifest::new("bucket");
        manifest.entries.push(entry("a.txt", b"hi"));
        manifest.entries.push(entry("b.txt", b"bye"));
        assert_eq!(manifest.total_bytes(), 5);
        assert!(!manifest.is_partial());

        manifest.failures.push(FailedEntry {
            logical_key: "c.txt".into(),
            reason: "access denied".into(),
        });
        assert!(manifest.is_partial());
        assert_eq!(manifest.failed_keys(), vec!["c.txt"]);
    }

    #[test]
    fn test_snapshot_ids_are_time_ordered() {
        let first = Manifest::new("");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Manifest::new("");
        assert!(first.snapshot_id < second.snapshot_id);
    }
}
