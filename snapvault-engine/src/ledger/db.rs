use crate::utils::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
  logical_name TEXT NOT NULL,
  sequence_number INTEGER NOT NULL CHECK(sequence_number >= 1),
  container_ref TEXT NOT NULL,
  created_at TEXT NOT NULL,
  entry_count INTEGER NOT NULL DEFAULT 0,
  total_bytes INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (logical_name, sequence_number)
);

CREATE TRIGGER IF NOT EXISTS ledger_entries_no_update
BEFORE UPDATE ON ledger_entries
BEGIN
  SELECT RAISE(ABORT, 'ledger entries are append-only');
END;

CREATE TRIGGER IF NOT EXISTS ledger_entries_no_delete
BEFORE DELETE ON ledger_entries
BEGIN
  SELECT RAISE(ABORT, 'ledger entries are append-only');
END;
"#;

/// Open (creating if needed) the ledger database and apply the schema.
pub fn create_pool(db_path: &Path) -> Result<DbPool> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    // Every pooled connection gets the same durability settings.
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = DELETE;
             PRAGMA synchronous = FULL;
             PRAGMA busy_timeout = 5000;",
        )
    });
    let pool = Pool::builder().max_size(4).build(manager)?;

    migrate(&pool)?;
    Ok(pool)
}

pub fn migrate(pool: &DbPool) -> Result<()> {
    tracing::debug!("[DB] Applying ledger schema");
    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
