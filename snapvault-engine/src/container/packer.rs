//! Snapshot packer.
//!
//! Streams every manifested object a second time, compressing it straight
//! into the container while re-hashing. Bytes that no longer match the
//! manifest are truncated away and the key is reported as dropped. The file
//! is only visible under its final name once the trailer digest is written
//! and the data synced to disk.

use super::{Compression, ContainerHeader, EntryRecord, FORMAT_VERSION, TRAILER_TAG};
use crate::config::{Config, RetryConfig};
use crate::manifest::checksum::Checksum;
use crate::manifest::{FailedEntry, Manifest, ManifestEntry};
use crate::report::format_bytes;
use crate::retry::wait_before_retry;
use crate::store::{ObjectDirectory, StoreError};
use crate::utils::{EngineError, Result};
use async_compression::tokio::write::ZstdEncoder;
use async_compression::Level;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A container that has been fully written, synced and renamed into place.
#[derive(Debug, Clone)]
pub struct SealedContainer {
    pub path: PathBuf,
    pub snapshot_id: String,
    /// Entries actually present in the container
    pub entries: Vec<ManifestEntry>,
    /// Manifest entries that could not be packed
    pub dropped: Vec<FailedEntry>,
    pub total_bytes: u64,
    pub container_bytes: u64,
    pub digest: Checksum,
}

impl SealedContainer {
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Why a single entry could not be written.
#[derive(Error, Debug)]
enum EntryError {
    #[error("{0}")]
    Source(StoreError),

    #[error("content changed since the manifest was built (checksum {actual}, expected {expected})")]
    Changed { expected: String, actual: String },

    /// Local write failure; ends the whole pack.
    #[error("{0}")]
    Sink(std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

pub struct SnapshotPacker {
    store: Arc<dyn ObjectDirectory>,
    compression: Compression,
    level: i32,
    retry: RetryConfig,
    chunk_size: usize,
}

impl SnapshotPacker {
    pub fn new(
        store: Arc<dyn ObjectDirectory>,
        compression: Compression,
        level: i32,
        retry: RetryConfig,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            compression,
            level,
            retry,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn from_config(store: Arc<dyn ObjectDirectory>, config: &Config) -> Result<Self> {
        Ok(Self::new(
            store,
            config.compression()?,
            config.pack.compression_level,
            config.retry.clone(),
            config.pack.chunk_size,
        ))
    }

    /// Write `manifest` into a sealed container at `destination`.
    ///
    /// On any error, including cancellation, the partial file is removed.
    pub async fn pack(
        &self,
        manifest: &Manifest,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<SealedContainer> {
        let partial = partial_path(destination);

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::Packing(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        match self.write_sealed(manifest, &partial, destination, cancel).await {
            Ok(sealed) => Ok(sealed),
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove partial container {}: {}", partial.display(), remove_err);
                    }
                }
                Err(e)
            }
        }
    }

    async fn write_sealed(
        &self,
        manifest: &Manifest,
        partial: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<SealedContainer> {
        let start_time = Instant::now();
        let packing = |what: &str, e: std::io::Error| {
            EngineError::Packing(format!("{} {}: {}", what, partial.display(), e))
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(partial)
            .await
            .map_err(|e| packing("failed to create", e))?;

        let header = ContainerHeader {
            format_version: FORMAT_VERSION,
            compression: self.compression,
            snapshot_id: manifest.snapshot_id.clone(),
            created_at: manifest.created_at,
            source: manifest.source.clone(),
            entry_count: 0,
        };
        let header_bytes = header.encode()?;
        file.write_all(&header_bytes)
            .await
            .map_err(|e| packing("failed to write header to", e))?;
        let count_offset = header_bytes.len() as u64 - 4;
        let mut offset = header_bytes.len() as u64;

        info!(
            snapshot_id = %manifest.snapshot_id,
            compression = %self.compression,
            "Packing {} entries into {}",
            manifest.entries.len(),
            partial.display()
        );

        let mut entries = Vec::with_capacity(manifest.entries.len());
        let mut dropped = Vec::new();

        for entry in &manifest.entries {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let record = EntryRecord {
                entry: entry.clone(),
                stored_len: 0,
            };
            let record_bytes = record.encode()?;

            match self.write_entry(&mut file, entry, &record_bytes, offset, cancel).await {
                Ok(stored_len) => {
                    debug!(
                        key = %entry.logical_key,
                        checksum = %entry.checksum.short(),
                        "Packed {} -> {} bytes",
                        entry.size_bytes,
                        stored_len
                    );
                    offset += record_bytes.len() as u64 + stored_len;
                    entries.push(entry.clone());
                }
                Err(EntryError::Cancelled) => return Err(EngineError::Cancelled),
                Err(EntryError::Sink(e)) => {
                    return Err(packing(&format!("failed to write '{}' into", entry.logical_key), e))
                }
                Err(e) => {
                    warn!(key = %entry.logical_key, "Dropping entry from container: {}", e);
                    rewind(&mut file, offset)
                        .await
                        .map_err(|e| packing("failed to truncate", e))?;
                    dropped.push(FailedEntry {
                        logical_key: entry.logical_key.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let entry_count = u32::try_from(entries.len())
            .map_err(|_| EngineError::Packing("more than u32::MAX entries".to_string()))?;
        let digest = self
            .seal(&mut file, count_offset, entry_count, offset)
            .await
            .map_err(|e| packing("failed to seal", e))?;
        let container_bytes = offset + super::TRAILER_LEN;
        drop(file);

        tokio::fs::rename(partial, destination).await.map_err(|e| {
            EngineError::Packing(format!(
                "failed to rename {} to {}: {}",
                partial.display(),
                destination.display(),
                e
            ))
        })?;

        let total_bytes = entries.iter().map(|e| e.size_bytes).sum();
        info!(
            snapshot_id = %manifest.snapshot_id,
            "Sealed {} ({} entries, {} dropped, {} -> {}) in {:.1}s",
            destination.display(),
            entries.len(),
            dropped.len(),
            format_bytes(total_bytes),
            format_bytes(container_bytes),
            start_time.elapsed().as_secs_f64()
        );

        Ok(SealedContainer {
            path: destination.to_path_buf(),
            snapshot_id: manifest.snapshot_id.clone(),
            entries,
            dropped,
            total_bytes,
            container_bytes,
            digest,
        })
    }

    /// Write one entry record and its payload at `entry_start`, retrying
    /// transient read failures. Returns the stored payload length.
    async fn write_entry(
        &self,
        file: &mut File,
        entry: &ManifestEntry,
        record_bytes: &[u8],
        entry_start: u64,
        cancel: &CancellationToken,
    ) -> std::result::Result<u64, EntryError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_write_entry(file, entry, record_bytes, entry_start, cancel).await {
                Err(EntryError::Source(e)) if e.is_transient() && attempt < self.retry.max_attempts => {
                    debug!(key = %entry.logical_key, attempt, error = %e, "Retrying after transient error");
                    if !wait_before_retry(&self.retry, attempt, cancel).await {
                        return Err(EntryError::Cancelled);
                    }
                }
                other => return other,
            }
        }
    }

    async fn try_write_entry(
        &self,
        file: &mut File,
        entry: &ManifestEntry,
        record_bytes: &[u8],
        entry_start: u64,
        cancel: &CancellationToken,
    ) -> std::result::Result<u64, EntryError> {
        rewind(file, entry_start).await.map_err(EntryError::Sink)?;
        file.write_all(record_bytes).await.map_err(EntryError::Sink)?;
        let payload_start = entry_start + record_bytes.len() as u64;

        let mut body = self
            .store
            .read(&entry.logical_key)
            .await
            .map_err(EntryError::Source)?;

        let (checksum, size) = match self.compression {
            Compression::None => {
                let digest = hashed_copy(&mut body.reader, &mut *file, self.chunk_size, cancel).await?;
                file.flush().await.map_err(EntryError::Sink)?;
                digest
            }
            Compression::Zstd => {
                let mut encoder = ZstdEncoder::with_quality(&mut *file, Level::Precise(self.level));
                let digest = hashed_copy(&mut body.reader, &mut encoder, self.chunk_size, cancel).await?;
                encoder.shutdown().await.map_err(EntryError::Sink)?;
                digest
            }
        };

        if checksum != entry.checksum || size != entry.size_bytes {
            return Err(EntryError::Changed {
                expected: entry.checksum.short(),
                actual: checksum.short(),
            });
        }

        let end = file.stream_position().await.map_err(EntryError::Sink)?;
        let stored_len = end - payload_start;

        // stored_len is the last field of the record
        file.seek(SeekFrom::Start(payload_start - 8))
            .await
            .map_err(EntryError::Sink)?;
        file.write_all(&stored_len.to_le_bytes())
            .await
            .map_err(EntryError::Sink)?;
        file.flush().await.map_err(EntryError::Sink)?;
        file.seek(SeekFrom::Start(end)).await.map_err(EntryError::Sink)?;

        Ok(stored_len)
    }

    /// Patch the entry count, append the trailer and sync.
    async fn seal(
        &self,
        file: &mut File,
        count_offset: u64,
        entry_count: u32,
        body_end: u64,
    ) -> std::io::Result<Checksum> {
        file.seek(SeekFrom::Start(count_offset)).await?;
        file.write_all(&entry_count.to_le_bytes()).await?;
        file.flush().await?;

        file.seek(SeekFrom::Start(body_end)).await?;
        file.write_all(&[TRAILER_TAG]).await?;
        file.flush().await?;

        file.seek(SeekFrom::Start(0)).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; self.chunk_size];
        let mut limited = (&mut *file).take(body_end + 1);
        loop {
            let n = limited.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        let digest = Checksum::from_hasher(hasher);

        file.seek(SeekFrom::Start(body_end + 1)).await?;
        file.write_all(digest.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;

        Ok(digest)
    }
}

/// `<destination>.partial`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    destination.with_file_name(name)
}

/// Drop everything from `position` on and continue writing there.
async fn rewind(file: &mut File, position: u64) -> std::io::Result<()> {
    file.flush().await?;
    file.set_len(position).await?;
    file.seek(SeekFrom::Start(position)).await?;
    Ok(())
}

/// Copy while hashing, keeping source failures apart from sink failures.
async fn hashed_copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> std::result::Result<(Checksum, u64), EntryError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(EntryError::Cancelled);
        }
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|e| EntryError::Source(StoreError::Io(e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        writer.write_all(&buffer[..n]).await.map_err(EntryError::Sink)?;
        total += n as u64;
    }

    Ok((Checksum::from_hasher(hasher), total))
}
