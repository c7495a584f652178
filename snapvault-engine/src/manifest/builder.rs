//! Manifest construction.
//!
//! Enumerates a source collection, then streams every object exactly once
//! through SHA-256 on a bounded worker pool. Workers finish in any order;
//! results are collated back into key order before the manifest is returned.

use super::checksum::digest_reader;
use super::{FailedEntry, Manifest, ManifestEntry};
use crate::config::{Config, RetryConfig};
use crate::report::format_bytes;
use crate::retry::retry_with_backoff;
use crate::store::{ObjectDirectory, RemoteObjectRef, StoreError};
use crate::utils::{EngineError, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of capturing one object.
enum Capture {
    Entry(ManifestEntry),
    Failed(FailedEntry),
    Cancelled,
}

pub struct ManifestBuilder {
    store: Arc<dyn ObjectDirectory>,
    workers: usize,
    retry: RetryConfig,
    chunk_size: usize,
    excluded: Vec<String>,
}

impl ManifestBuilder {
    pub fn new(
        store: Arc<dyn ObjectDirectory>,
        workers: usize,
        retry: RetryConfig,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            workers: workers.max(1),
            retry,
            chunk_size,
            excluded: Vec::new(),
        }
    }

    /// Leave out every key under `prefix` (a `/`-terminated directory).
    pub fn excluding(mut self, prefix: &str) -> Self {
        self.excluded.push(format!("{}/", prefix.trim_end_matches('/')));
        self
    }

    pub fn from_config(store: Arc<dyn ObjectDirectory>, config: &Config) -> Self {
        Self::new(
            store,
            config.performance.workers,
            config.retry.clone(),
            config.pack.chunk_size,
        )
    }

    /// Build a manifest covering every object under `source`.
    ///
    /// Fails only if the collection cannot be enumerated or the build is
    /// cancelled; unreadable objects become failure records.
    pub async fn build(&self, source: &str, cancel: &CancellationToken) -> Result<Manifest> {
        let start_time = Instant::now();
        let mut manifest = Manifest::new(source);

        info!(source = %source, snapshot_id = %manifest.snapshot_id, workers = self.workers, "Building manifest");

        let store = &self.store;
        let listed = retry_with_backoff(&self.retry, cancel, source, || async move {
            store.list(source).await
        })
        .await;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut objects = listed.map_err(|e| EngineError::Enumeration {
            source_id: source.to_string(),
            reason: e.to_string(),
        })?;

        if !self.excluded.is_empty() {
            let before = objects.len();
            objects.retain(|o| !self.excluded.iter().any(|p| o.logical_key.starts_with(p.as_str())));
            if objects.len() < before {
                debug!("Excluded {} objects under {:?}", before - objects.len(), self.excluded);
            }
        }

        objects.sort_by(|a, b| a.logical_key.cmp(&b.logical_key));
        if let Some(pair) = objects.windows(2).find(|w| w[0].logical_key == w[1].logical_key) {
            return Err(EngineError::Enumeration {
                source_id: source.to_string(),
                reason: format!("duplicate logical key '{}'", pair[0].logical_key),
            });
        }

        let enumerated_bytes: u64 = objects.iter().map(|o| o.size_bytes).sum();
        info!(
            "Enumerated {} objects ({}) under '{}'",
            objects.len(),
            format_bytes(enumerated_bytes),
            source
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(objects.len());

        for object in objects {
            let sem = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let retry = self.retry.clone();
            let cancel = cancel.clone();
            let chunk_size = self.chunk_size;

            handles.push(tokio::spawn(async move {
                let _permit = tokio::select! {
                    permit = sem.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return Capture::Cancelled,
                    },
                    _ = cancel.cancelled() => return Capture::Cancelled,
                };

                tokio::select! {
                    capture = capture_object(store.as_ref(), object, &retry, &cancel, chunk_size) => capture,
                    _ = cancel.cancelled() => Capture::Cancelled,
                }
            }));
        }

        // Awaiting in spawn order keeps the manifest in key order.
        let mut cancelled = false;
        for handle in handles {
            match handle.await {
                Ok(Capture::Entry(entry)) => manifest.entries.push(entry),
                Ok(Capture::Failed(failed)) => manifest.failures.push(failed),
                Ok(Capture::Cancelled) => cancelled = true,
                Err(e) => {
                    warn!("Checksum worker failed: {}", e);
                    cancelled |= e.is_cancelled();
                }
            }
        }

        if cancelled || cancel.is_cancelled() {
            info!(snapshot_id = %manifest.snapshot_id, "Manifest build cancelled");
            return Err(EngineError::Cancelled);
        }

        info!(
            snapshot_id = %manifest.snapshot_id,
            "Manifest built: {} entries ({}), {} failed, {:.1}s",
            manifest.entries.len(),
            format_bytes(manifest.total_bytes()),
            manifest.failures.len(),
            start_time.elapsed().as_secs_f64()
        );

        Ok(manifest)
    }
}

/// Stream one object through the hasher, retrying transient failures.
async fn capture_object(
    store: &dyn ObjectDirectory,
    object: RemoteObjectRef,
    retry: &RetryConfig,
    cancel: &CancellationToken,
    chunk_size: usize,
) -> Capture {
    let key = object.logical_key.as_str();

    let result = retry_with_backoff(retry, cancel, key, || async move {
        let mut body = store.read(key).await?;
        let (checksum, len) = digest_reader(&mut body.reader, chunk_size).await?;
        Ok::<_, StoreError>((checksum, len, body.remote_version_id))
    })
    .await;

    match result {
        Ok((checksum, size_bytes, read_version)) => {
            if read_version != object.remote_version_id {
                debug!(
                    key = %key,
                    listed = %object.remote_version_id,
                    read = %read_version,
                    "Object changed between enumeration and read"
                );
            }
            Capture::Entry(ManifestEntry {
                logical_key: object.logical_key.clone(),
                checksum,
                size_bytes,
                remote_version_id: object.remote_version_id,
            })
        }
        Err(_) if cancel.is_cancelled() => Capture::Cancelled,
        Err(e) => {
            let error = EngineError::ObjectUnreadable {
                key: key.to_string(),
                reason: e.to_string(),
            };
            warn!("{}", error);
            Capture::Failed(FailedEntry {
                logical_key: key.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::checksum::Checksum;
    use crate::store::MemoryDirectory;

    fn builder(store: Arc<MemoryDirectory>, workers: usize) -> ManifestBuilder {
        ManifestBuilder::new(
            store,
            workers,
            RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
            1024,
        )
    }

    #[tokio::test]
    async fn test_builds_sorted_manifest_with_digests() {
        let store = Arc::new(MemoryDirectory::new());
        store.put("b.txt", "bye");
        store.put("a.txt", "hi");

        let manifest = builder(store.clone(), 4)
            .build("", &CancellationToken::new())
            .await
            .unwrap();

        let keys: Vec<_> = manifest.entries.iter().map(|e| e.logical_key.as_str()).collect();
        assert_eq!(keys, vec!["a.txt", "b.txt"]);
        assert_eq!(manifest.entries[0].checksum, Checksum::of(b"hi"));
        assert_eq!(manifest.entries[1].checksum, Checksum::of(b"bye"));
        assert_eq!(manifest.entries[0].remote_version_id, store.version_of("a.txt").unwrap());
        assert!(!manifest.is_partial());
    }

    #[tokio::test]
    async fn test_excluded_prefix_is_not_captured() {
        let store = Arc::new(MemoryDirectory::new());
        store.put("a.txt", "hi");
        store.put("archives/docs/1.svc", "container");
        store.put("archives-old.txt", "kept");

        let manifest = builder(store.clone(), 2)
            .excluding("archives")
            .build("", &CancellationToken::new())
            .await
            .unwrap();

        let keys: Vec<_> = manifest.entries.iter().map(|e| e.logical_key.as_str()).collect();
        assert_eq!(keys, vec!["a.txt", "archives-old.txt"]);
        assert_eq!(store.read_count("archives/docs/1.svc"), 0);
    }

    #[tokio::test]
    async fn test_each_object_read_once() {
        let store = Arc::new(MemoryDirectory::new());
        for i in 0..50 {
            store.put(&format!("obj-{:02}", i), format!("content {}", i));
        }

        let manifest = builder(store.clone(), 3)
            .build("", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manifest.entries.len(), 50);
        for i in 0..50 {
            assert_eq!(store.read_count(&format!("obj-{:02}", i)), 1);
        }
        let keys: Vec<_> = manifest.entries.iter().map(|e| e.logical_key.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn test_unreadable_object_is_recorded_not_fatal() {
        let store = Arc::new(MemoryDirectory::new());
        store.put("a.txt", "1");
        store.put("b.txt", "2");
        store.put("c.txt", "3");
        store.fail_reads("b.txt");

        let manifest = builder(store, 2)
            .build("", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.failed_keys(), vec!["b.txt"]);
        assert!(manifest.failures[0].reason.contains("access denied"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(MemoryDirectory::new());
        store.put("slow.txt", "eventually");
        store.throttle_reads("slow.txt", 2);

        let manifest = builder(store.clone(), 1)
            .build("", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(store.read_count("slow.txt"), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_object_failed() {
        let store = Arc::new(MemoryDirectory::new());
        store.put("ok.txt", "fine");
        store.put("throttled.txt", "never");
        store.throttle_reads("throttled.txt", 10);

        let manifest = builder(store.clone(), 2)
            .build("", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.failed_keys(), vec!["throttled.txt"]);
        assert_eq!(store.read_count("throttled.txt"), 3);
    }

    #[tokio::test]
    async fn test_enumeration_failure_is_fatal() {
        let store = Arc::new(MemoryDirectory::new());
        store.fail_listing(Some("bucket does not exist"));

        let err = builder(store, 2)
            .build("", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Enumeration { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_build() {
        let store = Arc::new(MemoryDirectory::new());
        store.put("a", "1");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = builder(store, 1).build("", &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
