//! Version ledger.
//!
//! An append-only record of sealed containers per logical name. Sequence
//! numbers start at 1 and are allocated only here, inside an immediate
//! SQLite transaction, so they stay gapless even with several processes
//! sharing the same database file. Within one process, registrations for
//! the same name are additionally queued on a per-name async lock while
//! different names proceed in parallel.

pub mod db;

use crate::utils::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use db::DbPool;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Where a sealed container lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerRef {
    /// A container file on local disk
    Local { path: PathBuf },
    /// A container uploaded to the object store
    Remote { key: String, version_id: String },
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerRef::Local { path } => write!(f, "{}", path.display()),
            ContainerRef::Remote { key, version_id } => write!(f, "store:{}@{}", key, version_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionLedgerEntry {
    pub logical_name: String,
    pub sequence_number: u64,
    pub container: ContainerRef,
    pub created_at: DateTime<Utc>,
    pub entry_count: u64,
    pub total_bytes: u64,
}

fn row_to_entry(row: &Row) -> rusqlite::Result<VersionLedgerEntry> {
    let container_json: String = row.get("container_ref")?;
    let container = serde_json::from_str(&container_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
    })?;

    Ok(VersionLedgerEntry {
        logical_name: row.get("logical_name")?,
        sequence_number: row.get::<_, i64>("sequence_number")? as u64,
        container,
        created_at: row.get("created_at")?,
        entry_count: row.get::<_, i64>("entry_count")? as u64,
        total_bytes: row.get::<_, i64>("total_bytes")? as u64,
    })
}

const SELECT_ENTRY: &str = "SELECT logical_name, sequence_number, container_ref, created_at, \
                            entry_count, total_bytes FROM ledger_entries";

pub struct VersionLedger {
    pool: DbPool,
    path: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl VersionLedger {
    pub fn open(path: &Path) -> Result<Self> {
        let pool = db::create_pool(path)?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
            locks: DashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a new version for `logical_name`, allocating the next sequence
    /// number. Either the whole row is persisted or nothing is.
    pub async fn register(
        &self,
        logical_name: &str,
        container: ContainerRef,
        entry_count: u64,
        total_bytes: u64,
    ) -> Result<VersionLedgerEntry> {
        if logical_name.trim().is_empty() {
            return Err(EngineError::Ledger("logical name must not be empty".to_string()));
        }

        let lock = self
            .locks
            .entry(logical_name.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let pool = self.pool.clone();
        let name = logical_name.to_string();
        let entry = run_blocking(move || {
            let mut conn = pool.get()?;
            append(&mut conn, &name, container, entry_count, total_bytes)
        })
        .await?;

        info!(
            logical_name = %entry.logical_name,
            sequence = entry.sequence_number,
            "Registered version {} -> {}",
            entry.sequence_number,
            entry.container
        );
        Ok(entry)
    }

    /// All versions of `logical_name`, oldest first.
    pub async fn list(&self, logical_name: &str) -> Result<Vec<VersionLedgerEntry>> {
        let pool = self.pool.clone();
        let name = logical_name.to_string();
        run_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&format!(
                "{} WHERE logical_name = ?1 ORDER BY sequence_number ASC",
                SELECT_ENTRY
            ))?;
            let rows = stmt.query_map(params![name], row_to_entry)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn latest(&self, logical_name: &str) -> Result<VersionLedgerEntry> {
        let pool = self.pool.clone();
        let name = logical_name.to_string();
        run_blocking(move || {
            let conn = pool.get()?;
            conn.query_row(
                &format!(
                    "{} WHERE logical_name = ?1 ORDER BY sequence_number DESC LIMIT 1",
                    SELECT_ENTRY
                ),
                params![name],
                row_to_entry,
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("no versions recorded for '{}'", name)))
        })
        .await
    }

    pub async fn get(&self, logical_name: &str, sequence_number: u64) -> Result<VersionLedgerEntry> {
        let pool = self.pool.clone();
        let name = logical_name.to_string();
        run_blocking(move || {
            let conn = pool.get()?;
            conn.query_row(
                &format!(
                    "{} WHERE logical_name = ?1 AND sequence_number = ?2",
                    SELECT_ENTRY
                ),
                params![name, sequence_number as i64],
                row_to_entry,
            )
            .optional()?
            .ok_or_else(|| {
                EngineError::NotFound(format!("version {} of '{}'", sequence_number, name))
            })
        })
        .await
    }

    /// Logical names with at least one recorded version, sorted.
    pub async fn series(&self) -> Result<Vec<String>> {
        let pool = self.pool.clone();
        run_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT DISTINCT logical_name FROM ledger_entries ORDER BY logical_name ASC",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

fn append(
    conn: &mut Connection,
    logical_name: &str,
    container: ContainerRef,
    entry_count: u64,
    total_bytes: u64,
) -> Result<VersionLedgerEntry> {
    let container_json = serde_json::to_string(&container)?;
    let created_at = Utc::now();

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let sequence: i64 = tx.query_row(
        "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM ledger_entries WHERE logical_name = ?1",
        params![logical_name],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO ledger_entries (logical_name, sequence_number, container_ref, created_at, entry_count, total_bytes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            logical_name,
            sequence,
            container_json,
            created_at,
            entry_count as i64,
            total_bytes as i64
        ],
    )?;
    tx.commit()?;

    Ok(VersionLedgerEntry {
        logical_name: logical_name.to_string(),
        sequence_number: sequence as u64,
        container,
        created_at,
        entry_count,
        total_bytes,
    })
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Ledger(format!("ledger task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn local(name: &str) -> ContainerRef {
        ContainerRef::Local {
            path: PathBuf::from(format!("/backups/{}", name)),
        }
    }

    #[tokio::test]
    async fn test_register_list_latest_get() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = VersionLedger::open(&temp_dir.path().join("ledger.db")).unwrap();

        let first = ledger.register("nightly", local("1.svc"), 2, 5).await.unwrap();
        assert_eq!(first.sequence_number, 1);
        let second = ledger
            .register(
                "nightly",
                ContainerRef::Remote {
                    key: "archives/nightly/x.svc".into(),
                    version_id: "v9".into(),
                },
                1,
                3,
            )
            .await
            .unwrap();
        assert_eq!(second.sequence_number, 2);
        ledger.register("weekly", local("w.svc"), 0, 0).await.unwrap();

        let versions = ledger.list("nightly").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].sequence_number, 1);
        assert_eq!(versions[0].container, first.container);
        assert_eq!(versions[0].total_bytes, 5);
        assert_eq!(versions[1].container, second.container);

        assert_eq!(ledger.latest("nightly").await.unwrap().sequence_number, 2);
        assert_eq!(ledger.get("nightly", 1).await.unwrap().entry_count, 2);
        assert_eq!(ledger.latest("weekly").await.unwrap().sequence_number, 1);
        assert_eq!(ledger.series().await.unwrap(), vec!["nightly", "weekly"]);
    }

    #[tokio::test]
    async fn test_missing_versions_are_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = VersionLedger::open(&temp_dir.path().join("ledger.db")).unwrap();

        assert!(ledger.list("nothing").await.unwrap().is_empty());
        assert!(matches!(ledger.latest("nothing").await, Err(EngineError::NotFound(_))));
        ledger.register("a", local("a"), 0, 0).await.unwrap();
        assert!(matches!(ledger.get("a", 2).await, Err(EngineError::NotFound(_))));
        assert!(ledger.register(" ", local("a"), 0, 0).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registers_are_gapless() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Arc::new(VersionLedger::open(&temp_dir.path().join("ledger.db")).unwrap());

        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger
                    .register("nightly", local(&format!("{}.svc", i)), 1, 1)
                    .await
                    .unwrap()
                    .sequence_number
            }));
        }

        let mut sequences = BTreeSet::new();
        for handle in handles {
            assert!(sequences.insert(handle.await.unwrap()));
        }
        assert_eq!(sequences, (1..=20).collect::<BTreeSet<u64>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_separate_handles_share_one_sequence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.db");
        let a = Arc::new(VersionLedger::open(&path).unwrap());
        let b = Arc::new(VersionLedger::open(&path).unwrap());

        let mut handles = Vec::new();
        for i in 0..10 {
            let ledger = if i % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
            handles.push(tokio::spawn(async move {
                ledger.register("shared", local("x"), 0, 0).await.unwrap().sequence_number
            }));
        }
        let mut sequences = BTreeSet::new();
        for handle in handles {
            sequences.insert(handle.await.unwrap());
        }
        assert_eq!(sequences, (1..=10).collect::<BTreeSet<u64>>());
    }

    #[tokio::test]
    async fn test_entries_are_append_only() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.db");
        let ledger = VersionLedger::open(&path).unwrap();
        ledger.register("a", local("a"), 0, 0).await.unwrap();

        let conn = Connection::open(&path).unwrap();
        assert!(conn
            .execute("UPDATE ledger_entries SET entry_count = 5", [])
            .is_err());
        assert!(conn.execute("DELETE FROM ledger_entries", []).is_err());
        assert_eq!(ledger.list("a").await.unwrap().len(), 1);
    }

    #[test]
    fn test_container_ref_json() {
        let remote = ContainerRef::Remote {
            key: "archives/a/1.svc".into(),
            version_id: "v3".into(),
        };
        let json = serde_json::to_string(&remote).unwrap();
        assert!(json.contains("\"kind\":\"remote\""));
        assert_eq!(serde_json::from_str::<ContainerRef>(&json).unwrap(), remote);
        assert_eq!(remote.to_string(), "store:archives/a/1.svc@v3");
    }
}
