//! Snapshot container format.
//!
//! A container is a single self-describing file:
//!
//! ```text
//! header   magic "SNAPVLT\0" | version u16 | compression u8 | reserved u8
//!          | snapshot_id str16 | created_at i64 (unix ms) | source str16
//!          | entry_count u32
//! entry    0x01 | key str16 | checksum [32] | size u64 | remote_version str16
//!          | stored_len u64 | payload [stored_len]
//! trailer  0xFF | sha256 of every preceding byte [32]
//! ```
//!
//! All integers are little-endian; `str16` is a u16 byte length followed by
//! UTF-8. Payloads are either raw bytes or one zstd frame.

pub mod packer;

use crate::manifest::checksum::{digest_copy, Checksum, CHECKSUM_LEN};
use crate::manifest::ManifestEntry;
use crate::utils::{EngineError, Result};
use async_compression::tokio::bufread::ZstdDecoder;
use bytes::BufMut;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

pub use packer::{SealedContainer, SnapshotPacker};

pub const MAGIC: &[u8; 8] = b"SNAPVLT\0";
pub const FORMAT_VERSION: u16 = 1;
pub const ENTRY_TAG: u8 = 0x01;
pub const TRAILER_TAG: u8 = 0xFF;
/// Trailer tag plus digest.
pub const TRAILER_LEN: u64 = 1 + CHECKSUM_LEN as u64;
/// File extension of sealed containers.
pub const EXTENSION: &str = "svc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    fn code(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zstd => 1,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Compression::None),
            1 => Some(Compression::Zstd),
            _ => None,
        }
    }
}

impl FromStr for Compression {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Compression::None),
            "zstd" => Ok(Compression::Zstd),
            other => Err(EngineError::Config(format!(
                "unknown compression '{}' (expected zstd or none)",
                other
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => f.write_str("none"),
            Compression::Zstd => f.write_str("zstd"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerHeader {
    pub format_version: u16,
    pub compression: Compression,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub entry_count: u32,
}

impl ContainerHeader {
    /// Encode the header. The entry count always occupies the last four bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64 + self.snapshot_id.len() + self.source.len());
        buf.put_slice(MAGIC);
        buf.put_u16_le(self.format_version);
        buf.put_u8(self.compression.code());
        buf.put_u8(0);
        put_str16(&mut buf, &self.snapshot_id)?;
        buf.put_i64_le(self.created_at.timestamp_millis());
        put_str16(&mut buf, &self.source)?;
        buf.put_u32_le(self.entry_count);
        Ok(buf)
    }
}

/// One entry as recorded in the container, ahead of its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryRecord {
    #[serde(flatten)]
    pub entry: ManifestEntry,
    /// Payload length as stored (after compression)
    pub stored_len: u64,
}

impl EntryRecord {
    /// Encode the record; `stored_len` is the final eight bytes so the packer
    /// can patch it once the payload has been written.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let entry = &self.entry;
        let mut buf = Vec::with_capacity(64 + entry.logical_key.len());
        buf.put_u8(ENTRY_TAG);
        put_str16(&mut buf, &entry.logical_key)?;
        buf.put_slice(entry.checksum.as_bytes());
        buf.put_u64_le(entry.size_bytes);
        put_str16(&mut buf, &entry.remote_version_id)?;
        buf.put_u64_le(self.stored_len);
        Ok(buf)
    }
}

fn put_str16(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| EngineError::Packing(format!("string field longer than 65535 bytes: {:.40}...", value)))?;
    buf.put_u16_le(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Sequential reader over a container's records.
///
/// Does not check the trailer digest; call [`verify_digest`] first when the
/// file's provenance is not already trusted.
pub struct ContainerReader {
    path: PathBuf,
    reader: BufReader<File>,
    header: ContainerHeader,
    file_len: u64,
    offset: u64,
    entries_read: u32,
    /// Unconsumed payload bytes of the record last returned.
    pending_payload: u64,
    finished: bool,
}

impl ContainerReader {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).await?;
        let file_len = file.metadata().await?.len();

        let mut reader = Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            header: ContainerHeader {
                format_version: 0,
                compression: Compression::None,
                snapshot_id: String::new(),
                created_at: DateTime::<Utc>::default(),
                source: String::new(),
                entry_count: 0,
            },
            file_len,
            offset: 0,
            entries_read: 0,
            pending_payload: 0,
            finished: false,
        };
        reader.header = reader.read_header().await?;
        Ok(reader)
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_header(&mut self) -> Result<ContainerHeader> {
        let mut magic = [0u8; 8];
        self.read_exact(&mut magic).await?;
        if &magic != MAGIC {
            return Err(self.corrupt("not a snapshot container (bad magic)"));
        }

        let format_version = self.read_u16().await?;
        if format_version != FORMAT_VERSION {
            return Err(self.corrupt(format!("unsupported format version {}", format_version)));
        }
        let code = self.read_u8().await?;
        let compression = Compression::from_code(code)
            .ok_or_else(|| self.corrupt(format!("unknown compression code {}", code)))?;
        let _reserved = self.read_u8().await?;

        let snapshot_id = self.read_str16().await?;
        let millis = self.read_i64().await?;
        let created_at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| self.corrupt(format!("invalid creation time {}", millis)))?;
        let source = self.read_str16().await?;
        let entry_count = self.read_u32().await?;

        Ok(ContainerHeader {
            format_version,
            compression,
            snapshot_id,
            created_at,
            source,
            entry_count,
        })
    }

    /// Advance to the next entry record, skipping any unread payload of the
    /// previous one. Returns `None` once the trailer is reached.
    pub async fn next_entry(&mut self) -> Result<Option<EntryRecord>> {
        if self.finished {
            return Ok(None);
        }
        self.skip_payload().await?;

        match self.read_u8().await? {
            ENTRY_TAG => {}
            TRAILER_TAG => {
                if self.entries_read != self.header.entry_count {
                    return Err(self.corrupt(format!(
                        "header declares {} entries but {} are present",
                        self.header.entry_count, self.entries_read
                    )));
                }
                self.finished = true;
                return Ok(None);
            }
            tag => return Err(self.corrupt(format!("unexpected record tag 0x{:02x}", tag))),
        }

        if self.entries_read >= self.header.entry_count {
            return Err(self.corrupt("more entries than the header declares"));
        }

        let logical_key = self.read_str16().await?;
        let mut checksum = [0u8; CHECKSUM_LEN];
        self.read_exact(&mut checksum).await?;
        let size_bytes = self.read_u64().await?;
        let remote_version_id = self.read_str16().await?;
        let stored_len = self.read_u64().await?;

        if stored_len > self.file_len.saturating_sub(self.offset + TRAILER_LEN) {
            return Err(self.corrupt(format!(
                "payload of '{}' ({} bytes) runs past the end of the file",
                logical_key, stored_len
            )));
        }

        self.entries_read += 1;
        self.pending_payload = stored_len;

        Ok(Some(EntryRecord {
            entry: ManifestEntry {
                logical_key,
                checksum: Checksum::from_bytes(checksum),
                size_bytes,
                remote_version_id,
            },
            stored_len,
        }))
    }

    /// Decode the current payload into `writer`, hashing the decoded bytes.
    ///
    /// The outer result fails only when the reader can no longer continue.
    /// The inner result carries payload-level problems (bad zstd frame, a
    /// failing writer); the reader stays positioned at the next record.
    pub async fn copy_payload<W>(
        &mut self,
        writer: &mut W,
        chunk_size: usize,
    ) -> Result<std::io::Result<(Checksum, u64)>>
    where
        W: tokio::io::AsyncWrite + Unpin + ?Sized,
    {
        let stored = std::mem::take(&mut self.pending_payload);
        let mut limited = (&mut self.reader).take(stored);

        let outcome = match self.header.compression {
            Compression::None => digest_copy(&mut limited, writer, chunk_size).await,
            Compression::Zstd => {
                let mut decoder = ZstdDecoder::new(&mut limited);
                digest_copy(&mut decoder, writer, chunk_size).await
            }
        };

        tokio::io::copy(&mut limited, &mut tokio::io::sink())
            .await
            .map_err(|e| self.corrupt(format!("failed to drain payload: {}", e)))?;
        self.offset += stored;

        Ok(outcome)
    }

    /// Discard the current payload without decoding it.
    pub async fn skip_payload(&mut self) -> Result<()> {
        let stored = std::mem::take(&mut self.pending_payload);
        if stored == 0 {
            return Ok(());
        }
        let skipped = tokio::io::copy(&mut (&mut self.reader).take(stored), &mut tokio::io::sink()).await?;
        if skipped != stored {
            return Err(self.corrupt("truncated payload"));
        }
        self.offset += stored;
        Ok(())
    }

    fn corrupt(&self, reason: impl Into<String>) -> EngineError {
        EngineError::corrupt(self.path.display(), reason)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.reader.read_exact(buf).await {
            Ok(_) => {
                self.offset += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(self.corrupt(format!("unexpected end of file at offset {}", self.offset)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    async fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf).await?;
        Ok(u16::from_le_bytes(buf))
    }

    async fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).await?;
        Ok(u32::from_le_bytes(buf))
    }

    async fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf).await?;
        Ok(u64::from_le_bytes(buf))
    }

    async fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf).await?;
        Ok(i64::from_le_bytes(buf))
    }

    async fn read_str16(&mut self) -> Result<String> {
        let len = self.read_u16().await? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        String::from_utf8(buf).map_err(|_| self.corrupt("string field is not valid UTF-8"))
    }
}

/// Check the trailer digest against the bytes that precede it.
pub async fn verify_digest(path: &Path, chunk_size: usize) -> Result<Checksum> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    if len < MAGIC.len() as u64 + TRAILER_LEN {
        return Err(EngineError::corrupt(path.display(), "file too short"));
    }

    let covered = len - CHECKSUM_LEN as u64;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut last_byte = 0u8;
    let mut remaining = covered;

    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let n = file.read(&mut buffer[..want]).await?;
        if n == 0 {
            return Err(EngineError::corrupt(path.display(), "file shrank while verifying"));
        }
        hasher.update(&buffer[..n]);
        last_byte = buffer[n - 1];
        remaining -= n as u64;
    }

    if last_byte != TRAILER_TAG {
        return Err(EngineError::corrupt(path.display(), "missing trailer"));
    }

    let mut recorded = [0u8; CHECKSUM_LEN];
    file.read_exact(&mut recorded).await?;
    let computed = Checksum::from_hasher(hasher);
    if computed.as_bytes() != &recorded {
        return Err(EngineError::corrupt(
            path.display(),
            format!(
                "trailer digest mismatch (recorded {}, computed {})",
                Checksum::from_bytes(recorded).short(),
                computed.short()
            ),
        ));
    }

    Ok(computed)
}

/// Header and entry listing of a container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub header: ContainerHeader,
    pub entries: Vec<EntryRecord>,
    pub container_bytes: u64,
}

impl ContainerSummary {
    /// Sum of the uncompressed entry sizes.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|r| r.entry.size_bytes).sum()
    }

    pub fn stored_bytes(&self) -> u64 {
        self.entries.iter().map(|r| r.stored_len).sum()
    }
}

/// Read the header and every entry record, skipping payloads.
pub async fn inspect(path: &Path) -> Result<ContainerSummary> {
    let mut reader = ContainerReader::open(path).await?;
    let mut entries = Vec::with_capacity(reader.header().entry_count as usize);
    while let Some(record) = reader.next_entry().await? {
        entries.push(record);
    }

    Ok(ContainerSummary {
        header: reader.header().clone(),
        entries,
        container_bytes: reader.file_len,
    })
}

/// Result of a full, read-only verification.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub digest: Checksum,
    pub entries_checked: usize,
    /// Keys whose payload does not decode to the recorded checksum and size
    pub mismatched: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.mismatched.is_empty()
    }
}

/// Verify the trailer digest, then decode every payload and compare it with
/// its recorded checksum. Writes nothing.
pub async fn verify(path: &Path, chunk_size: usize) -> Result<VerifyReport> {
    let digest = verify_digest(path, chunk_size).await?;
    let mut reader = ContainerReader::open(path).await?;
    let mut entries_checked = 0;
    let mut mismatched = Vec::new();

    while let Some(record) = reader.next_entry().await? {
        entries_checked += 1;
        let outcome = reader
            .copy_payload(&mut tokio::io::sink(), chunk_size)
            .await?;
        match outcome {
            Ok((checksum, len))
                if checksum == record.entry.checksum && len == record.entry.size_bytes => {}
            Ok(_) => mismatched.push(record.entry.logical_key),
            Err(e) => {
                tracing::debug!(key = %record.entry.logical_key, "Payload decode failed: {}", e);
                mismatched.push(record.entry.logical_key);
            }
        }
    }

    Ok(VerifyReport {
        digest,
        entries_checked,
        mismatched,
    })
}
