//! In-process object store.
//!
//! Keeps objects in a sorted map with a monotonically increasing version
//! counter. Faults can be injected per key (permanent read failure, a number
//! of transient throttling failures) or for the whole listing, which makes
//! this the store of choice for exercising partial-failure paths.

use super::{validate_key, ByteStream, ObjectBody, ObjectDirectory, RemoteObjectRef, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: u64,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Faults {
    unreadable: HashSet<String>,
    unwritable: HashSet<String>,
    throttled: HashMap<String, u32>,
    list_failure: Option<String>,
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    faults: RwLock<Faults>,
    reads: RwLock<HashMap<String, u32>>,
    writes: AtomicU64,
    next_version: AtomicU64,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace an object, returning its new version identifier.
    pub fn put(&self, key: &str, data: impl Into<Bytes>) -> String {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        let object = StoredObject {
            data: data.into(),
            version,
            modified: Utc::now(),
        };
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), object);
        format_version(version)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|o| o.data.clone())
    }

    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .map(|o| o.data)
    }

    pub fn version_of(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|o| format_version(o.version))
    }

    /// All keys with their content, in key order.
    pub fn snapshot(&self) -> BTreeMap<String, Bytes> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, o)| (k.clone(), o.data.clone()))
            .collect()
    }

    /// Every read of `key` fails permanently.
    pub fn fail_reads(&self, key: &str) {
        self.faults
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .unreadable
            .insert(key.to_string());
    }

    /// Every write to `key` fails permanently.
    pub fn fail_writes(&self, key: &str) {
        self.faults
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .unwritable
            .insert(key.to_string());
    }

    /// The next `times` reads of `key` fail with a transient error.
    pub fn throttle_reads(&self, key: &str, times: u32) {
        self.faults
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .throttled
            .insert(key.to_string(), times);
    }

    /// Listing fails until cleared with `None`.
    pub fn fail_listing(&self, reason: Option<&str>) {
        self.faults.write().unwrap_or_else(|e| e.into_inner()).list_failure =
            reason.map(str::to_string);
    }

    /// Number of read attempts made for `key`, including failed ones.
    pub fn read_count(&self, key: &str) -> u32 {
        self.reads
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_read_faults(&self, key: &str) -> Result<(), StoreError> {
        let mut faults = self.faults.write().unwrap_or_else(|e| e.into_inner());
        if faults.unreadable.contains(key) {
            return Err(StoreError::Other(format!("access denied: {}", key)));
        }
        if let Some(remaining) = faults.throttled.get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Transient(format!("slow down: {}", key)));
            }
        }
        Ok(())
    }
}

fn format_version(version: u64) -> String {
    format!("v{}", version)
}

#[async_trait]
impl ObjectDirectory for MemoryDirectory {
    async fn list(&self, source: &str) -> Result<Vec<RemoteObjectRef>, StoreError> {
        if let Some(reason) = &self.faults.read().unwrap_or_else(|e| e.into_inner()).list_failure {
            return Err(StoreError::Other(reason.clone()));
        }

        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .iter()
            .filter(|(key, _)| key.starts_with(source))
            .map(|(key, o)| RemoteObjectRef {
                logical_key: key.clone(),
                size_bytes: o.data.len() as u64,
                last_modified: o.modified,
                remote_version_id: format_version(o.version),
            })
            .collect())
    }

    async fn read(&self, logical_key: &str) -> Result<ObjectBody, StoreError> {
        *self
            .reads
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(logical_key.to_string())
            .or_insert(0) += 1;

        self.check_read_faults(logical_key)?;

        let object = self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(logical_key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(logical_key.to_string()))?;

        Ok(ObjectBody {
            remote_version_id: format_version(object.version),
            reader: Box::pin(std::io::Cursor::new(object.data)),
        })
    }

    async fn write(&self, logical_key: &str, mut body: ByteStream) -> Result<String, StoreError> {
        validate_key(logical_key)?;
        if self
            .faults
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .unwritable
            .contains(logical_key)
        {
            return Err(StoreError::Other(format!("write rejected: {}", logical_key)));
        }
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(self.put(logical_key, data))
    }

    async fn delete(&self, logical_key: &str) -> Result<(), StoreError> {
        self.remove(logical_key);
        Ok(())
    }
}
