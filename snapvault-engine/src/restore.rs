//! Restore coordinator.
//!
//! Replays a sealed container back into an object directory. The container
//! digest is always checked before anything is written. Each payload is
//! decoded into a local spool file and hashed there, so only content that
//! matches its recorded checksum is ever sent to the store.

use crate::config::{Config, RetryConfig};
use crate::container::{verify_digest, ContainerReader, EntryRecord};
use crate::ledger::ContainerRef;
use crate::manifest::checksum::digest_copy;
use crate::report::{RunSummary, Severity};
use crate::retry::retry_with_backoff;
use crate::store::{ObjectDirectory, StoreError};
use crate::utils::{EngineError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempPath};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreOptions {
    /// Abort on the first entry whose content fails verification; nothing is
    /// written unless every entry verifies
    pub strict: bool,
    /// Leave keys alone whose current remote version differs from the one
    /// captured in the snapshot
    pub conflict_aware: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    Integrity(String),
    WriteFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Integrity(reason) => write!(f, "integrity: {}", reason),
            SkipReason::WriteFailed(reason) => write!(f, "write failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum KeyOutcome {
    Restored,
    Skipped(SkipReason),
    Conflict(String),
}

impl fmt::Display for KeyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyOutcome::Restored => f.write_str("restored"),
            KeyOutcome::Skipped(reason) => write!(f, "skipped ({})", reason),
            KeyOutcome::Conflict(reason) => write!(f, "conflict ({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyReport {
    pub logical_key: String,
    pub outcome: KeyOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub snapshot_id: String,
    pub container: String,
    pub keys: Vec<KeyReport>,
    pub bytes_restored: u64,
    /// Set when the stored container is no longer the registered revision
    pub version_drift: Option<String>,
}

impl RestoreReport {
    pub fn restored(&self) -> usize {
        self.count(|o| matches!(o, KeyOutcome::Restored))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, KeyOutcome::Skipped(_)))
    }

    pub fn conflicts(&self) -> usize {
        self.count(|o| matches!(o, KeyOutcome::Conflict(_)))
    }

    fn count(&self, pred: impl Fn(&KeyOutcome) -> bool) -> usize {
        self.keys.iter().filter(|k| pred(&k.outcome)).count()
    }

    pub fn outcome_of(&self, logical_key: &str) -> Option<&KeyOutcome> {
        self.keys
            .iter()
            .find(|k| k.logical_key == logical_key)
            .map(|k| &k.outcome)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            succeeded: self.restored(),
            skipped: self.conflicts(),
            failed: self.skipped(),
            bytes: self.bytes_restored,
        }
    }

    pub fn severity(&self) -> Severity {
        let integrity = self
            .keys
            .iter()
            .any(|k| matches!(k.outcome, KeyOutcome::Skipped(SkipReason::Integrity(_))));
        if integrity {
            Severity::Integrity
        } else if self.restored() < self.keys.len() {
            Severity::RestoreIncomplete
        } else {
            Severity::Success
        }
    }
}

/// A container on local disk, possibly a downloaded temporary copy.
struct LocalContainer {
    path: PathBuf,
    _download: Option<TempPath>,
    drift: Option<String>,
}

/// A remote container downloaded into the staging directory. The file is
/// removed when this is dropped.
pub struct FetchedContainer {
    pub path: TempPath,
    /// Revision the store served
    pub version_id: String,
}

pub struct RestoreCoordinator {
    store: Arc<dyn ObjectDirectory>,
    retry: RetryConfig,
    chunk_size: usize,
    staging_dir: PathBuf,
}

impl RestoreCoordinator {
    pub fn new(
        store: Arc<dyn ObjectDirectory>,
        retry: RetryConfig,
        chunk_size: usize,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            retry,
            chunk_size: chunk_size.max(1),
            staging_dir: staging_dir.into(),
        }
    }

    pub fn from_config(store: Arc<dyn ObjectDirectory>, config: &Config) -> Self {
        Self::new(
            store,
            config.retry.clone(),
            config.pack.chunk_size,
            config.engine.staging_dir.clone(),
        )
    }

    pub async fn restore(
        &self,
        container: &ContainerRef,
        options: RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let local = self.resolve(container, cancel).await?;
        let digest = verify_digest(&local.path, self.chunk_size).await?;
        debug!(container = %container, digest = %digest.short(), "Container digest verified");

        if let Some(drift) = &local.drift {
            if options.strict {
                return Err(EngineError::Integrity {
                    key: container.to_string(),
                    reason: drift.clone(),
                });
            }
            warn!(container = %container, "{}", drift);
        }

        if options.strict {
            self.verify_entries(&local.path, cancel).await?;
        }

        let mut reader = ContainerReader::open(&local.path).await?;
        let snapshot_id = reader.header().snapshot_id.clone();
        let source = reader.header().source.clone();

        let current_versions = if options.conflict_aware {
            Some(self.current_versions(&source, cancel).await?)
        } else {
            None
        };

        info!(
            snapshot_id = %snapshot_id,
            strict = options.strict,
            conflict_aware = options.conflict_aware,
            "Restoring {} entries from {}",
            reader.header().entry_count,
            container
        );

        let mut keys = Vec::with_capacity(reader.header().entry_count as usize);
        let mut bytes_restored = 0u64;

        while let Some(record) = reader.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let key = record.entry.logical_key.clone();

            if let Some(current) = current_versions
                .as_ref()
                .and_then(|versions| versions.get(&key))
            {
                if current != &record.entry.remote_version_id {
                    let reason = format!(
                        "remote version {} differs from snapshot version {}",
                        current, record.entry.remote_version_id
                    );
                    warn!(key = %key, "Conflict, not overwriting: {}", reason);
                    keys.push(KeyReport {
                        logical_key: key,
                        outcome: KeyOutcome::Conflict(reason),
                    });
                    continue;
                }
            }

            let outcome = match self.spool_verified(&mut reader, &record).await? {
                Err(reason) => {
                    if options.strict {
                        return Err(EngineError::Integrity { key, reason });
                    }
                    warn!(key = %key, "Skipping entry that failed verification: {}", reason);
                    KeyOutcome::Skipped(SkipReason::Integrity(reason))
                }
                Ok(spool) => match self.write_back(&key, &spool, cancel).await {
                    Ok(version) => {
                        debug!(key = %key, version = %version, "Restored");
                        bytes_restored += record.entry.size_bytes;
                        KeyOutcome::Restored
                    }
                    Err(_) if cancel.is_cancelled() => return Err(EngineError::Cancelled),
                    Err(reason) => {
                        warn!(key = %key, "Write failed: {}", reason);
                        KeyOutcome::Skipped(SkipReason::WriteFailed(reason))
                    }
                },
            };
            keys.push(KeyReport {
                logical_key: key,
                outcome,
            });
        }

        let report = RestoreReport {
            snapshot_id,
            container: container.to_string(),
            keys,
            bytes_restored,
            version_drift: local.drift.clone(),
        };
        info!(snapshot_id = %report.snapshot_id, "Restore finished: {}", report.summary());
        Ok(report)
    }

    /// Local path of the container, downloading remote ones to staging.
    async fn resolve(
        &self,
        container: &ContainerRef,
        cancel: &CancellationToken,
    ) -> Result<LocalContainer> {
        match container {
            ContainerRef::Local { path } => {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Err(EngineError::NotFound(format!(
                        "container {} does not exist",
                        path.display()
                    )));
                }
                Ok(LocalContainer {
                    path: path.clone(),
                    _download: None,
                    drift: None,
                })
            }
            ContainerRef::Remote { key, version_id } => {
                let fetched = self.fetch(key, cancel).await?;
                let drift = (&fetched.version_id != version_id).then(|| {
                    format!(
                        "stored container {} is at version {}, ledger recorded {}",
                        key, fetched.version_id, version_id
                    )
                });
                Ok(LocalContainer {
                    path: fetched.path.to_path_buf(),
                    _download: Some(fetched.path),
                    drift,
                })
            }
        }
    }

    /// Download the container stored under `key` into the staging directory.
    pub async fn fetch(&self, key: &str, cancel: &CancellationToken) -> Result<FetchedContainer> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let download = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".svc")
            .tempfile_in(&self.staging_dir)?
            .into_temp_path();
        let store = &self.store;
        let chunk_size = self.chunk_size;
        let target: &Path = &download;

        let version_id = retry_with_backoff(&self.retry, cancel, key, || async move {
            let mut body = store.read(key).await?;
            let mut file = tokio::fs::File::create(target).await?;
            digest_copy(&mut body.reader, &mut file, chunk_size).await?;
            file.sync_all().await?;
            Ok::<_, StoreError>(body.remote_version_id)
        })
        .await
        .map_err(|e| match e {
            StoreError::NotFound(_) => EngineError::NotFound(format!("container {} in store", key)),
            _ if cancel.is_cancelled() => EngineError::Cancelled,
            other => EngineError::Store(other),
        })?;

        Ok(FetchedContainer {
            path: download,
            version_id,
        })
    }

    /// Decode every payload without writing anything; the first mismatch is
    /// an error.
    async fn verify_entries(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        let mut reader = ContainerReader::open(path).await?;
        while let Some(record) = reader.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let outcome = reader
                .copy_payload(&mut tokio::io::sink(), self.chunk_size)
                .await?;
            if let Err(reason) = check_payload(&record, outcome) {
                return Err(EngineError::Integrity {
                    key: record.entry.logical_key,
                    reason,
                });
            }
        }
        Ok(())
    }

    async fn current_versions(
        &self,
        source: &str,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>> {
        let store = &self.store;
        let objects = retry_with_backoff(&self.retry, cancel, source, || async move {
            store.list(source).await
        })
        .await
        .map_err(|e| EngineError::Enumeration {
            source_id: source.to_string(),
            reason: e.to_string(),
        })?;

        Ok(objects
            .into_iter()
            .map(|o| (o.logical_key, o.remote_version_id))
            .collect())
    }

    /// Decode the current payload into a spool file. The inner error is a
    /// verification failure for this entry only.
    async fn spool_verified(
        &self,
        reader: &mut ContainerReader,
        record: &EntryRecord,
    ) -> Result<std::result::Result<TempPath, String>> {
        let spool = NamedTempFile::new_in(&self.staging_dir)?;
        let mut file = tokio::fs::File::from_std(spool.reopen()?);
        let outcome = reader.copy_payload(&mut file, self.chunk_size).await?;
        drop(file);

        Ok(check_payload(record, outcome).map(|()| spool.into_temp_path()))
    }

    async fn write_back(
        &self,
        key: &str,
        spool: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, String> {
        let store = &self.store;
        retry_with_backoff(&self.retry, cancel, key, || async move {
            let file = tokio::fs::File::open(spool).await?;
            store.write(key, Box::pin(file)).await
        })
        .await
        .map_err(|e| e.to_string())
    }
}

fn check_payload(
    record: &EntryRecord,
    outcome: std::io::Result<(crate::manifest::checksum::Checksum, u64)>,
) -> std::result::Result<(), String> {
    let (checksum, size) = outcome.map_err(|e| format!("payload could not be decoded: {}", e))?;
    if checksum != record.entry.checksum {
        return Err(format!(
            "checksum {} does not match recorded {}",
            checksum.short(),
            record.entry.checksum.short()
        ));
    }
    if size != record.entry.size_bytes {
        return Err(format!(
            "decoded {} bytes, expected {}",
            size, record.entry.size_bytes
        ));
    }
    Ok(())
}
