//! Snapshot job executor - orchestrates backups, archives and restores.
//!
//! Ties together the engine components:
//! - Manifest builder (enumerate + checksum)
//! - Snapshot packer (sealed container)
//! - Version ledger (sequence allocation)
//! - Restore coordinator

pub mod job_tracker;

use crate::config::Config;
use crate::container::{self, ContainerSummary, SnapshotPacker, VerifyReport, EXTENSION};
use crate::ledger::{ContainerRef, VersionLedger, VersionLedgerEntry};
use crate::manifest::{FailedEntry, ManifestBuilder};
use crate::report::{RunSummary, Severity};
use crate::restore::{RestoreCoordinator, RestoreOptions, RestoreReport};
use crate::retry::retry_with_backoff;
use crate::scheduler::Trigger;
use crate::store::{FileListDirectory, FsDirectory, ObjectDirectory, StoreError};
use crate::utils::{EngineError, Result};
use job_tracker::JobTracker;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Key prefix under which archive containers are uploaded.
pub const ARCHIVE_PREFIX: &str = "archives";

/// Result of a backup run that produced a registered container.
#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub entry: VersionLedgerEntry,
    /// Keys left out of the container, with reasons
    pub failed: Vec<FailedEntry>,
    pub summary: RunSummary,
    pub duration_secs: f64,
}

impl BackupOutcome {
    pub fn severity(&self) -> Severity {
        if self.failed.is_empty() {
            Severity::Success
        } else {
            Severity::Partial
        }
    }
}

/// Result of an archive run: the container lives in the store.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveOutcome {
    pub entry: VersionLedgerEntry,
    pub key: String,
    pub version_id: String,
    pub failed: Vec<FailedEntry>,
    pub summary: RunSummary,
}

impl ArchiveOutcome {
    pub fn severity(&self) -> Severity {
        if self.failed.is_empty() {
            Severity::Success
        } else {
            Severity::Partial
        }
    }
}

/// Main snapshot engine
pub struct Engine {
    config: Config,
    store: Arc<dyn ObjectDirectory>,
    ledger: Arc<VersionLedger>,
    jobs: JobTracker,
}

impl Engine {
    pub fn new(config: Config, store: Arc<dyn ObjectDirectory>, ledger: Arc<VersionLedger>) -> Self {
        Self {
            config,
            store,
            ledger,
            jobs: JobTracker::new(),
        }
    }

    /// Engine over the filesystem-backed store and SQLite ledger named in
    /// the configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn ObjectDirectory> = Arc::new(FsDirectory::new(&config.store.root));
        let ledger = Arc::new(VersionLedger::open(&config.engine.ledger_path)?);
        Ok(Self::new(config, store, ledger))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    pub fn store(&self) -> Arc<dyn ObjectDirectory> {
        Arc::clone(&self.store)
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    /// Snapshot the configured source into a local container and register it.
    pub async fn backup_create(
        &self,
        logical_name: &str,
        cancel: &CancellationToken,
    ) -> Result<BackupOutcome> {
        validate_logical_name(logical_name)?;
        let guard = self.jobs.start(logical_name, cancel)?;
        let cancel = guard.token();
        let start_time = Instant::now();

        info!(logical_name = %logical_name, source = %self.config.store.source, "Starting backup");

        let manifest = ManifestBuilder::from_config(self.store(), &self.config)
            .excluding(ARCHIVE_PREFIX)
            .build(&self.config.store.source, cancel)
            .await?;

        let destination = self
            .config
            .engine
            .backups_dir
            .join(logical_name)
            .join(format!("{}.{}", manifest.snapshot_id, EXTENSION));
        let sealed = SnapshotPacker::from_config(self.store(), &self.config)?
            .pack(&manifest, &destination, cancel)
            .await?;

        if cancel.is_cancelled() {
            discard_local(&sealed.path).await;
            return Err(EngineError::Cancelled);
        }

        let container_path = tokio::fs::canonicalize(&sealed.path)
            .await
            .unwrap_or_else(|_| sealed.path.clone());
        let container = ContainerRef::Local {
            path: container_path,
        };
        let entry = self
            .register_or_orphan(logical_name, container, sealed.entry_count() as u64, sealed.total_bytes)
            .await?;

        let mut failed = manifest.failures;
        failed.extend(sealed.dropped);
        let summary = RunSummary {
            succeeded: sealed.entries.len(),
            skipped: 0,
            failed: failed.len(),
            bytes: sealed.total_bytes,
        };

        info!(
            logical_name = %logical_name,
            sequence = entry.sequence_number,
            "Backup finished: {}",
            summary
        );
        for failure in &failed {
            warn!(key = %failure.logical_key, "Not included: {}", failure.reason);
        }

        Ok(BackupOutcome {
            entry,
            failed,
            summary,
            duration_secs: start_time.elapsed().as_secs_f64(),
        })
    }

    /// Every registered version of `logical_name`, oldest first.
    pub async fn backup_list(&self, logical_name: &str) -> Result<Vec<VersionLedgerEntry>> {
        self.ledger.list(logical_name).await
    }

    /// Restore the latest (or the given) version of `logical_name`.
    pub async fn backup_restore(
        &self,
        logical_name: &str,
        sequence: Option<u64>,
        options: RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let entry = match sequence {
            Some(n) => self.ledger.get(logical_name, n).await?,
            None => self.ledger.latest(logical_name).await?,
        };
        info!(
            logical_name = %logical_name,
            sequence = entry.sequence_number,
            "Restoring from {}",
            entry.container
        );
        RestoreCoordinator::from_config(self.store(), &self.config)
            .restore(&entry.container, options, cancel)
            .await
    }

    pub async fn inspect(&self, path: &Path) -> Result<ContainerSummary> {
        container::inspect(path).await
    }

    pub async fn verify(&self, path: &Path) -> Result<VerifyReport> {
        container::verify(path, self.config.pack.chunk_size).await
    }

    /// Register an existing sealed container, typically one orphaned by a
    /// failed ledger write. The container is verified first.
    pub async fn register_container(
        &self,
        logical_name: &str,
        path: &Path,
    ) -> Result<VersionLedgerEntry> {
        validate_logical_name(logical_name)?;
        let summary = self.verified_summary(path).await?;
        let path = tokio::fs::canonicalize(path).await?;

        self.ledger
            .register(
                logical_name,
                ContainerRef::Local { path },
                summary.entries.len() as u64,
                summary.total_bytes(),
            )
            .await
    }

    /// Register a container already held in the store under `key`, such as
    /// an uploaded archive whose ledger write failed. The stored copy is
    /// downloaded and verified first.
    pub async fn register_archive(
        &self,
        logical_name: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<VersionLedgerEntry> {
        validate_logical_name(logical_name)?;
        let fetched = RestoreCoordinator::from_config(self.store(), &self.config)
            .fetch(key, cancel)
            .await?;
        let summary = self.verified_summary(&fetched.path).await?;

        self.ledger
            .register(
                logical_name,
                ContainerRef::Remote {
                    key: key.to_string(),
                    version_id: fetched.version_id.clone(),
                },
                summary.entries.len() as u64,
                summary.total_bytes(),
            )
            .await
    }

    /// Every registered container name, for listings.
    pub async fn series(&self) -> Result<Vec<String>> {
        self.ledger.series().await
    }

    async fn verified_summary(&self, path: &Path) -> Result<ContainerSummary> {
        let report = self.verify(path).await?;
        if !report.is_ok() {
            return Err(EngineError::Integrity {
                key: report.mismatched.join(", "),
                reason: format!("container {} has entries that fail verification", path.display()),
            });
        }
        container::inspect(path).await
    }

    /// Pack local files into a container, upload it to the store, register
    /// it, then drop the staging copy.
    pub async fn archive_create(
        &self,
        logical_name: &str,
        files: Vec<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<ArchiveOutcome> {
        validate_logical_name(logical_name)?;
        if files.is_empty() {
            return Err(EngineError::Enumeration {
                source_id: logical_name.to_string(),
                reason: "no files given".to_string(),
            });
        }
        let guard = self.jobs.start(logical_name, cancel)?;
        let cancel = guard.token();

        let listing = FileListDirectory::new(files).map_err(|e| EngineError::Enumeration {
            source_id: logical_name.to_string(),
            reason: e.to_string(),
        })?;
        let files: Arc<dyn ObjectDirectory> = Arc::new(listing);

        let manifest = ManifestBuilder::from_config(Arc::clone(&files), &self.config)
            .build("", cancel)
            .await
            .map_err(|e| match e {
                EngineError::Enumeration { reason, .. } => EngineError::Enumeration {
                    source_id: logical_name.to_string(),
                    reason,
                },
                other => other,
            })?;
        if manifest.entries.is_empty() && manifest.is_partial() {
            return Err(EngineError::Enumeration {
                source_id: logical_name.to_string(),
                reason: format!(
                    "none of the given files could be read: {}",
                    manifest.failed_keys().join(", ")
                ),
            });
        }

        let staging = self
            .config
            .engine
            .staging_dir
            .join(format!("{}.{}", manifest.snapshot_id, EXTENSION));
        let sealed = SnapshotPacker::from_config(files, &self.config)?
            .pack(&manifest, &staging, cancel)
            .await?;

        let key = format!(
            "{}/{}/{}.{}",
            ARCHIVE_PREFIX, logical_name, manifest.snapshot_id, EXTENSION
        );
        let uploaded = self.upload(&key, &sealed.path, cancel).await;
        let version_id = match uploaded {
            Ok(version_id) => version_id,
            Err(e) => {
                discard_local(&sealed.path).await;
                return Err(if cancel.is_cancelled() {
                    EngineError::Cancelled
                } else {
                    e.into()
                });
            }
        };
        info!(key = %key, version = %version_id, "Archive uploaded");

        if cancel.is_cancelled() {
            if let Err(e) = self.store.delete(&key).await {
                warn!(key = %key, "Failed to remove uploaded archive after cancel: {}", e);
            }
            discard_local(&sealed.path).await;
            return Err(EngineError::Cancelled);
        }

        let container = ContainerRef::Remote {
            key: key.clone(),
            version_id: version_id.clone(),
        };
        let registered = self
            .register_or_orphan(logical_name, container, sealed.entry_count() as u64, sealed.total_bytes)
            .await;
        discard_local(&sealed.path).await;
        let entry = registered?;

        let mut failed = manifest.failures;
        failed.extend(sealed.dropped);
        let summary = RunSummary {
            succeeded: sealed.entries.len(),
            skipped: 0,
            failed: failed.len(),
            bytes: sealed.total_bytes,
        };
        info!(logical_name = %logical_name, sequence = entry.sequence_number, "Archive finished: {}", summary);

        Ok(ArchiveOutcome {
            entry,
            key,
            version_id,
            failed,
            summary,
        })
    }

    /// Archive versions of `logical_name` (containers held in the store).
    pub async fn archive_list(&self, logical_name: &str) -> Result<Vec<VersionLedgerEntry>> {
        Ok(self
            .ledger
            .list(logical_name)
            .await?
            .into_iter()
            .filter(|entry| matches!(entry.container, ContainerRef::Remote { .. }))
            .collect())
    }

    /// Restore the latest (or the given) archive version back into the store.
    pub async fn archive_restore(
        &self,
        logical_name: &str,
        sequence: Option<u64>,
        options: RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let archives = self.archive_list(logical_name).await?;
        let entry = match sequence {
            Some(n) => archives.into_iter().find(|e| e.sequence_number == n),
            None => archives.into_iter().last(),
        }
        .ok_or_else(|| {
            EngineError::NotFound(match sequence {
                Some(n) => format!("archive version {} of '{}'", n, logical_name),
                None => format!("no archives recorded for '{}'", logical_name),
            })
        })?;

        RestoreCoordinator::from_config(self.store(), &self.config)
            .restore(&entry.container, options, cancel)
            .await
    }

    /// Trigger for the scheduler: one backup of `logical_name` per call.
    pub fn backup_trigger(self: &Arc<Self>, logical_name: &str, shutdown: CancellationToken) -> Trigger {
        let engine = Arc::clone(self);
        let name = logical_name.to_string();
        Arc::new(move || {
            let engine = Arc::clone(&engine);
            let name = name.clone();
            let shutdown = shutdown.clone();
            Box::pin(async move {
                match engine.backup_create(&name, &shutdown).await {
                    Ok(outcome) => info!(
                        logical_name = %name,
                        sequence = outcome.entry.sequence_number,
                        "Scheduled backup finished: {}",
                        outcome.summary
                    ),
                    Err(EngineError::Busy(_)) => {
                        warn!(logical_name = %name, "Skipping scheduled run: backup already running")
                    }
                    Err(e) => error!(logical_name = %name, error = %e, "Scheduled backup failed"),
                }
            })
        })
    }

    async fn upload(
        &self,
        key: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, StoreError> {
        let store = &self.store;
        retry_with_backoff(&self.config.retry, cancel, key, || async move {
            let file = tokio::fs::File::open(path).await?;
            store.write(key, Box::pin(file)).await
        })
        .await
    }

    async fn register_or_orphan(
        &self,
        logical_name: &str,
        container: ContainerRef,
        entry_count: u64,
        total_bytes: u64,
    ) -> Result<VersionLedgerEntry> {
        // Names what `backup register` / `archive register` take to adopt it
        let described = match &container {
            ContainerRef::Local { path } => path.display().to_string(),
            ContainerRef::Remote { key, .. } => format!("store key {}", key),
        };
        self.ledger
            .register(logical_name, container, entry_count, total_bytes)
            .await
            .map_err(|e| {
                let err = EngineError::LedgerWrite {
                    logical_name: logical_name.to_string(),
                    container: described,
                    reason: e.to_string(),
                };
                error!("{}", err);
                err
            })
    }
}

/// Logical names double as directory and key segments.
pub fn validate_logical_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "invalid logical name '{}' (use letters, digits, '-', '_' or '.')",
            name
        )))
    }
}

async fn discard_local(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::manifest::checksum::Checksum;
    use crate::restore::KeyOutcome;
    use crate::store::{ByteStream, MemoryDirectory, ObjectBody, RemoteObjectRef};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.engine.data_dir = dir.join("data");
        config.engine.backups_dir = dir.join("backups");
        config.engine.ledger_path = dir.join("data/ledger.db");
        config.engine.staging_dir = dir.join("data/staging");
        config.store.root = dir.join("bucket");
        config.performance.workers = 2;
        config.retry = RetryConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        config
    }

    fn engine_with(dir: &Path, store: Arc<dyn ObjectDirectory>) -> Engine {
        let config = test_config(dir);
        let ledger = Arc::new(VersionLedger::open(&config.engine.ledger_path).unwrap());
        Engine::new(config, store, ledger)
    }

    fn container_files(dir: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    }

    /// Cancels the token on the n-th read.
    struct CancellingStore {
        inner: MemoryDirectory,
        cancel: CancellationToken,
        reads: AtomicUsize,
        cancel_on: usize,
    }

    #[async_trait]
    impl ObjectDirectory for CancellingStore {
        async fn list(&self, source: &str) -> std::result::Result<Vec<RemoteObjectRef>, StoreError> {
            self.inner.list(source).await
        }

        async fn read(&self, key: &str) -> std::result::Result<ObjectBody, StoreError> {
            if self.reads.fetch_add(1, Ordering::SeqCst) + 1 == self.cancel_on {
                self.cancel.cancel();
            }
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, body: ByteStream) -> std::result::Result<String, StoreError> {
            self.inner.write(key, body).await
        }
    }

    /// Cancels the token right after a write lands.
    struct CancelAfterWrite {
        inner: Arc<MemoryDirectory>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl ObjectDirectory for CancelAfterWrite {
        async fn list(&self, source: &str) -> std::result::Result<Vec<RemoteObjectRef>, StoreError> {
            self.inner.list(source).await
        }

        async fn read(&self, key: &str) -> std::result::Result<ObjectBody, StoreError> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, body: ByteStream) -> std::result::Result<String, StoreError> {
            let version = self.inner.write(key, body).await;
            self.cancel.cancel();
            version
        }

        async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    fn archive_keys(store: &MemoryDirectory) -> Vec<String> {
        store
            .snapshot()
            .into_keys()
            .filter(|k| k.starts_with("archives/"))
            .collect()
    }

    #[tokio::test]
    async fn test_backup_then_restore_scenario() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDirectory::new());
        store.put("a.txt", "hi");
        store.put("b.txt", "bye");
        let engine = engine_with(temp_dir.path(), store.clone());
        let cancel = CancellationToken::new();

        let outcome = engine.backup_create("nightly", &cancel).await.unwrap();
        assert_eq!(outcome.entry.sequence_number, 1);
        assert_eq!(outcome.entry.entry_count, 2);
        assert_eq!(outcome.severity(), Severity::Success);

        let ContainerRef::Local { path } = &outcome.entry.container else {
            panic!("backup container should be local");
        };
        let summary = engine.inspect(path).await.unwrap();
        assert_eq!(summary.entries[0].entry.checksum, Checksum::of(b"hi"));
        assert_eq!(summary.entries[1].entry.checksum, Checksum::of(b"bye"));

        store.remove("a.txt");
        store.remove("b.txt");
        let report = engine
            .backup_restore("nightly", None, RestoreOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.restored(), 2);
        assert_eq!(report.skipped(), 0);
        assert_eq!(store.get("a.txt").unwrap().as_ref(), b"hi");
        assert_eq!(store.get("b.txt").unwrap().as_ref(), b"bye");
    }

    #[tokio::test]
    async fn test_partial_backup_exit_code() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDirectory::new());
        store.put("a.txt", "1");
        store.put("b.txt", "2");
        store.put("c.txt", "3");
        store.fail_reads("b.txt");
        let engine = engine_with(temp_dir.path(), store);

        let outcome = engine
            .backup_create("nightly", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.entry.entry_count, 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].logical_key, "b.txt");
        assert_eq!(outcome.severity().exit_code(), crate::report::EXIT_PARTIAL);

        let ContainerRef::Local { path } = &outcome.entry.container else {
            panic!("backup container should be local");
        };
        assert!(engine.verify(path).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_mid_pack_registers_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let inner = MemoryDirectory::new();
        inner.put("a.txt", "1");
        inner.put("b.txt", "2");
        inner.put("c.txt", "3");
        // three manifest reads, then the second packer read cancels
        let store = Arc::new(CancellingStore {
            inner,
            cancel: cancel.clone(),
            reads: AtomicUsize::new(0),
            cancel_on: 5,
        });
        let engine = engine_with(temp_dir.path(), store);

        let err = engine.backup_create("nightly", &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(err.severity().exit_code(), crate::report::EXIT_CANCELLED);
        assert!(engine.backup_list("nightly").await.unwrap().is_empty());
        assert!(container_files(&temp_dir.path().join("backups")).is_empty());
        assert!(!engine.jobs().is_running("nightly"));
    }

    #[tokio::test]
    async fn test_concurrent_backup_of_same_name_is_busy() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_with(temp_dir.path(), Arc::new(MemoryDirectory::new()));
        let cancel = CancellationToken::new();

        let _running = engine.jobs().start("nightly", &cancel).unwrap();
        let err = engine.backup_create("nightly", &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Busy(_)));
        assert!(engine.backup_create("weekly", &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_restore_specific_sequence() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDirectory::new());
        store.put("a.txt", "first");
        let engine = engine_with(temp_dir.path(), store.clone());
        let cancel = CancellationToken::new();

        engine.backup_create("nightly", &cancel).await.unwrap();
        store.put("a.txt", "second");
        let second = engine.backup_create("nightly", &cancel).await.unwrap();
        assert_eq!(second.entry.sequence_number, 2);

        engine
            .backup_restore("nightly", Some(1), RestoreOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(store.get("a.txt").unwrap().as_ref(), b"first");

        let missing = engine
            .backup_restore("nightly", Some(9), RestoreOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(missing, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_archive_create_list_restore() {
        let temp_dir = TempDir::new().unwrap();
        let files_dir = temp_dir.path().join("loose");
        std::fs::create_dir_all(&files_dir).unwrap();
        std::fs::write(files_dir.join("report.pdf"), b"%PDF-1.4").unwrap();
        std::fs::write(files_dir.join("photo.jpeg"), vec![0xFFu8; 4096]).unwrap();

        let store = Arc::new(MemoryDirectory::new());
        let engine = engine_with(temp_dir.path(), store.clone());
        let cancel = CancellationToken::new();

        let outcome = engine
            .archive_create(
                "docs",
                vec![files_dir.join("report.pdf"), files_dir.join("photo.jpeg")],
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(outcome.entry.entry_count, 2);
        assert!(outcome.key.starts_with("archives/docs/"));
        assert!(store.get(&outcome.key).is_some());
        assert!(container_files(&engine.config().engine.staging_dir).is_empty());

        let archives = engine.archive_list("docs").await.unwrap();
        assert_eq!(archives.len(), 1);
        assert!(matches!(archives[0].container, ContainerRef::Remote { .. }));

        let report = engine
            .archive_restore("docs", None, RestoreOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.outcome_of("report.pdf"), Some(&KeyOutcome::Restored));
        assert_eq!(store.get("report.pdf").unwrap().as_ref(), b"%PDF-1.4");
        assert_eq!(store.get("photo.jpeg").unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_archive_with_missing_file_is_partial() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("good.txt"), b"good").unwrap();
        let store = Arc::new(MemoryDirectory::new());
        let engine = engine_with(temp_dir.path(), store.clone());

        let outcome = engine
            .archive_create(
                "docs",
                vec![temp_dir.path().join("good.txt"), temp_dir.path().join("gone.txt")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.entry.entry_count, 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].logical_key, "gone.txt");
        assert_eq!(outcome.severity().exit_code(), crate::report::EXIT_PARTIAL);
        assert_eq!(engine.archive_list("docs").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_archive_with_no_readable_files_fails_enumeration() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDirectory::new());
        let engine = engine_with(temp_dir.path(), store.clone());

        let err = engine
            .archive_create(
                "docs",
                vec![temp_dir.path().join("missing.txt")],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Enumeration { ref source_id, .. } if source_id == "docs"));
        assert!(engine.archive_list("docs").await.unwrap().is_empty());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_archive_cancelled_after_upload_removes_object() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("report.pdf"), b"%PDF-1.4").unwrap();
        let target = Arc::new(MemoryDirectory::new());
        let cancel = CancellationToken::new();
        let store = Arc::new(CancelAfterWrite {
            inner: target.clone(),
            cancel: cancel.clone(),
        });
        let engine = engine_with(temp_dir.path(), store);

        let err = engine
            .archive_create("docs", vec![temp_dir.path().join("report.pdf")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(target.write_count(), 1);
        assert!(archive_keys(&target).is_empty());
        assert!(engine.archive_list("docs").await.unwrap().is_empty());
        assert!(container_files(&engine.config().engine.staging_dir).is_empty());
    }

    #[tokio::test]
    async fn test_archive_orphaned_by_ledger_failure_can_be_registered() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("report.pdf"), b"%PDF-1.4").unwrap();
        let store = Arc::new(MemoryDirectory::new());
        let engine = engine_with(temp_dir.path(), store.clone());
        let cancel = CancellationToken::new();

        let conn = rusqlite::Connection::open(&engine.config().engine.ledger_path).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_insert BEFORE INSERT ON ledger_entries \
             BEGIN SELECT RAISE(ABORT, 'ledger unavailable'); END;",
        )
        .unwrap();

        let err = engine
            .archive_create("docs", vec![temp_dir.path().join("report.pdf")], &cancel)
            .await
            .unwrap_err();
        let keys = archive_keys(&store);
        assert_eq!(keys.len(), 1);
        assert!(matches!(err, EngineError::LedgerWrite { ref container, .. } if container.contains(&keys[0])));
        assert_eq!(err.severity().exit_code(), crate::report::EXIT_LEDGER);
        assert!(engine.archive_list("docs").await.unwrap().is_empty());

        conn.execute_batch("DROP TRIGGER reject_insert;").unwrap();
        let entry = engine.register_archive("docs", &keys[0], &cancel).await.unwrap();
        assert_eq!(entry.sequence_number, 1);
        assert_eq!(entry.entry_count, 1);
        assert!(matches!(entry.container, ContainerRef::Remote { ref key, .. } if key == &keys[0]));

        store.remove("report.pdf");
        engine
            .archive_restore("docs", None, RestoreOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(store.get("report.pdf").unwrap().as_ref(), b"%PDF-1.4");
    }

    #[tokio::test]
    async fn test_register_archive_rejects_missing_and_corrupt_objects() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDirectory::new());
        store.put("archives/docs/bad.svc", "not a container at all, definitely not");
        let engine = engine_with(temp_dir.path(), store);
        let cancel = CancellationToken::new();

        assert!(matches!(
            engine.register_archive("docs", "archives/docs/none.svc", &cancel).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.register_archive("docs", "archives/docs/bad.svc", &cancel).await,
            Err(EngineError::CorruptContainer { .. })
        ));
        assert!(engine.series().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backup_leaves_out_archive_containers() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("report.pdf"), b"%PDF-1.4").unwrap();
        let store = Arc::new(MemoryDirectory::new());
        store.put("a.txt", "hi");
        let engine = engine_with(temp_dir.path(), store.clone());
        let cancel = CancellationToken::new();

        engine
            .archive_create("docs", vec![temp_dir.path().join("report.pdf")], &cancel)
            .await
            .unwrap();
        let outcome = engine.backup_create("nightly", &cancel).await.unwrap();
        assert_eq!(outcome.entry.entry_count, 1);
        assert_eq!(engine.series().await.unwrap(), vec!["docs", "nightly"]);
    }

    #[tokio::test]
    async fn test_register_orphaned_container() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDirectory::new());
        store.put("a.txt", "hi");
        let engine = engine_with(temp_dir.path(), store);
        let cancel = CancellationToken::new();

        let outcome = engine.backup_create("nightly", &cancel).await.unwrap();
        let ContainerRef::Local { path } = outcome.entry.container else {
            panic!("backup container should be local");
        };

        let entry = engine.register_container("recovered", &path).await.unwrap();
        assert_eq!(entry.sequence_number, 1);
        assert_eq!(entry.entry_count, 1);

        let junk = temp_dir.path().join("junk.svc");
        std::fs::write(&junk, b"not a container at all, definitely not").unwrap();
        assert!(matches!(
            engine.register_container("recovered", &junk).await,
            Err(EngineError::CorruptContainer { .. })
        ));
        assert_eq!(engine.backup_list("recovered").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_engine_over_filesystem_store() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path());
        std::fs::create_dir_all(config.store.root.join("docs")).unwrap();
        std::fs::write(config.store.root.join("docs/a.txt"), b"alpha").unwrap();
        std::fs::write(config.store.root.join("b.txt"), b"beta").unwrap();

        let engine = Engine::from_config(config.clone()).unwrap();
        let cancel = CancellationToken::new();
        let outcome = engine.backup_create("fs", &cancel).await.unwrap();
        assert_eq!(outcome.entry.entry_count, 2);

        std::fs::remove_file(config.store.root.join("docs/a.txt")).unwrap();
        std::fs::write(config.store.root.join("b.txt"), b"changed").unwrap();

        let report = engine
            .backup_restore("fs", None, RestoreOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.restored(), 2);
        assert_eq!(std::fs::read(config.store.root.join("docs/a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(config.store.root.join("b.txt")).unwrap(), b"beta");
    }

    #[tokio::test]
    async fn test_scheduled_trigger_runs_backup() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDirectory::new());
        store.put("a.txt", "hi");
        let engine = Arc::new(engine_with(temp_dir.path(), store));

        let trigger = engine.backup_trigger("nightly", CancellationToken::new());
        trigger().await;
        trigger().await;
        assert_eq!(engine.backup_list("nightly").await.unwrap().len(), 2);
    }

    #[test]
    fn test_validate_logical_name() {
        assert!(validate_logical_name("nightly").is_ok());
        assert!(validate_logical_name("db-2024_v1.0").is_ok());
        assert!(validate_logical_name("").is_err());
        assert!(validate_logical_name("..").is_err());
        assert!(validate_logical_name("a/b").is_err());
        assert!(validate_logical_name("with space").is_err());
    }
}
