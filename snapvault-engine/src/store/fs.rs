//! Filesystem-backed object store.
//!
//! A directory tree is treated as a bucket: keys are `/`-separated paths
//! relative to the root, version identifiers are derived from modification
//! time and size, and writes land atomically through a temp file + rename.

use super::{validate_key, ByteStream, ObjectBody, ObjectDirectory, RemoteObjectRef, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Prefix of in-flight upload files; never listed.
const TEMP_PREFIX: &str = ".svtmp-";

#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

/// Version identifier for a file: nanosecond mtime and size, hex encoded.
fn version_for(metadata: &Metadata) -> String {
    let nanos = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}-{:x}", nanos, metadata.len())
}

fn modified_at(metadata: &Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH))
}

/// Turn a path relative to the root into an object key.
fn key_from_relative(relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn walk_objects(root: &Path, start: &Path) -> Result<Vec<RemoteObjectRef>, StoreError> {
    let mut objects = Vec::new();

    for entry in WalkDir::new(start).follow_links(false) {
        let entry = entry.map_err(|e| {
            StoreError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;

        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let Some(key) = key_from_relative(relative) else {
            warn!("Skipping object with non UTF-8 name: {}", entry.path().display());
            continue;
        };

        let metadata = entry.metadata().map_err(|e| {
            StoreError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("metadata read failed")),
            )
        })?;

        objects.push(RemoteObjectRef {
            logical_key: key,
            size_bytes: metadata.len(),
            last_modified: modified_at(&metadata),
            remote_version_id: version_for(&metadata),
        });
    }

    Ok(objects)
}

#[async_trait]
impl ObjectDirectory for FsDirectory {
    async fn list(&self, source: &str) -> Result<Vec<RemoteObjectRef>, StoreError> {
        if !self.root.is_dir() {
            return Err(StoreError::NotFound(format!(
                "store root {}",
                self.root.display()
            )));
        }

        let prefix = source.trim_end_matches('/');
        let start = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.path_for(prefix)?
        };
        if !start.exists() {
            debug!("Source prefix {} has no objects", prefix);
            return Ok(Vec::new());
        }

        let root = self.root.clone();
        let mut objects = tokio::task::spawn_blocking(move || walk_objects(&root, &start))
            .await
            .map_err(|e| StoreError::Other(format!("listing task failed: {}", e)))??;

        objects.sort_by(|a, b| a.logical_key.cmp(&b.logical_key));
        Ok(objects)
    }

    async fn read(&self, logical_key: &str) -> Result<ObjectBody, StoreError> {
        let path = self.path_for(logical_key)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(logical_key.to_string()))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound(logical_key.to_string()));
        }

        Ok(ObjectBody {
            remote_version_id: version_for(&metadata),
            reader: Box::pin(file),
        })
    }

    async fn write(&self, logical_key: &str, mut body: ByteStream) -> Result<String, StoreError> {
        let path = self.path_for(logical_key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Other(format!("no parent for {}", path.display())))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let temp_path = parent.join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
        let result = async {
            let mut out = tokio::fs::File::create(&temp_path).await?;
            tokio::io::copy(&mut body, &mut out).await?;
            out.flush().await?;
            out.sync_all().await?;
            drop(out);
            tokio::fs::rename(&temp_path, &path).await?;
            let metadata = tokio::fs::metadata(&path).await?;
            Ok::<_, std::io::Error>(version_for(&metadata))
        }
        .await;

        match result {
            Ok(version) => {
                debug!(key = %logical_key, version = %version, "Object written");
                Ok(version)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Err(StoreError::Io(e))
            }
        }
    }

    async fn delete(&self, logical_key: &str) -> Result<(), StoreError> {
        let path = self.path_for(logical_key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}
