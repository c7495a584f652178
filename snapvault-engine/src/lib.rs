//! Snapshot & Archive Engine Library
//!
//! Captures point-in-time snapshots of a remote object store into sealed,
//! self-verifying containers, tracks them in an append-only version ledger
//! and restores them with per-object integrity checks.

pub mod config;
pub mod container;
pub mod daemon;
pub mod executor;
pub mod ledger;
pub mod manifest;
pub mod report;
pub mod restore;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{ArchiveOutcome, BackupOutcome, Engine};
pub use ledger::{ContainerRef, VersionLedger, VersionLedgerEntry};
pub use report::{RunSummary, Severity};
pub use restore::{RestoreOptions, RestoreReport};
pub use scheduler::{BackupScheduler, Cadence};
pub use store::{ObjectDirectory, StoreError};
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
