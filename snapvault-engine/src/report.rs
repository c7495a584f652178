//! Run summaries, severities and process exit codes.
//!
//! Exit codes are grouped by range so scripts can branch on the class of
//! outcome without parsing output:
//!
//! | Range | Meaning                                              |
//! |-------|------------------------------------------------------|
//! | 0     | full success                                         |
//! | 10-19 | partial success (some objects failed or were skipped)|
//! | 20-29 | integrity failure during restore                     |
//! | 30-39 | fatal error, nothing (new) was registered            |

use serde::Serialize;
use std::fmt;

pub const EXIT_OK: i32 = 0;
pub const EXIT_PARTIAL: i32 = 10;
pub const EXIT_RESTORE_INCOMPLETE: i32 = 11;
pub const EXIT_INTEGRITY: i32 = 20;
pub const EXIT_CORRUPT_CONTAINER: i32 = 21;
pub const EXIT_FATAL_IO: i32 = 30;
pub const EXIT_ENUMERATION: i32 = 31;
pub const EXIT_LEDGER: i32 = 32;
pub const EXIT_CANCELLED: i32 = 33;
pub const EXIT_CONFIG: i32 = 34;
pub const EXIT_UNAVAILABLE: i32 = 35;

/// Outcome class of a run, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Partial,
    RestoreIncomplete,
    Integrity,
    CorruptContainer,
    Unavailable,
    Config,
    Cancelled,
    Ledger,
    Enumeration,
    Fatal,
}

impl Severity {
    pub fn exit_code(self) -> i32 {
        match self {
            Severity::Success => EXIT_OK,
            Severity::Partial => EXIT_PARTIAL,
            Severity::RestoreIncomplete => EXIT_RESTORE_INCOMPLETE,
            Severity::Integrity => EXIT_INTEGRITY,
            Severity::CorruptContainer => EXIT_CORRUPT_CONTAINER,
            Severity::Fatal => EXIT_FATAL_IO,
            Severity::Enumeration => EXIT_ENUMERATION,
            Severity::Ledger => EXIT_LEDGER,
            Severity::Cancelled => EXIT_CANCELLED,
            Severity::Config => EXIT_CONFIG,
            Severity::Unavailable => EXIT_UNAVAILABLE,
        }
    }
}

/// Succeeded / skipped / failed counts printed at the end of every run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes: u64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} skipped, {} failed ({})",
            self.succeeded,
            self.skipped,
            self.failed,
            format_bytes(self.bytes)
        )
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}
