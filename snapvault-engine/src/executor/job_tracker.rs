//! Job tracking for running snapshot jobs.
//!
//! At most one job per logical name runs at a time. Each job gets its own
//! cancellation token derived from the caller's, so a single job can be
//! cancelled by name without touching the others.

use crate::utils::{EngineError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tracks running jobs and provides a cancellation mechanism
#[derive(Clone, Default)]
pub struct JobTracker {
    jobs: Arc<DashMap<String, CancellationToken>>,
}

/// Marks a job as running until dropped.
pub struct JobGuard {
    jobs: Arc<DashMap<String, CancellationToken>>,
    logical_name: String,
    token: CancellationToken,
}

impl JobGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.jobs.remove(&self.logical_name);
        debug!(logical_name = %self.logical_name, "Job finished");
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job for `logical_name`, failing with `Busy` if one is
    /// already running.
    pub fn start(&self, logical_name: &str, parent: &CancellationToken) -> Result<JobGuard> {
        match self.jobs.entry(logical_name.to_string()) {
            Entry::Occupied(_) => Err(EngineError::Busy(logical_name.to_string())),
            Entry::Vacant(slot) => {
                let token = parent.child_token();
                slot.insert(token.clone());
                debug!(logical_name = %logical_name, "Job started");
                Ok(JobGuard {
                    jobs: Arc::clone(&self.jobs),
                    logical_name: logical_name.to_string(),
                    token,
                })
            }
        }
    }

    /// Cancel a running job by name
    pub fn cancel(&self, logical_name: &str) -> bool {
        match self.jobs.get(logical_name) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, logical_name: &str) -> bool {
        self.jobs.contains_key(logical_name)
    }

    /// Get count of running jobs
    pub fn running_count(&self) -> usize {
        self.jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_start_is_busy_until_guard_drops() {
        let tracker = JobTracker::new();
        let root = CancellationToken::new();

        let guard = tracker.start("nightly", &root).unwrap();
        assert!(matches!(tracker.start("nightly", &root), Err(EngineError::Busy(_))));
        assert!(tracker.start("weekly", &root).is_ok());
        assert_eq!(tracker.running_count(), 1);

        drop(guard);
        assert!(!tracker.is_running("nightly"));
        assert!(tracker.start("nightly", &root).is_ok());
    }

    #[test]
    fn test_cancel_by_name() {
        let tracker = JobTracker::new();
        let root = CancellationToken::new();
        let a = tracker.start("a", &root).unwrap();
        let b = tracker.start("b", &root).unwrap();

        assert!(tracker.cancel("a"));
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());
        assert!(!tracker.cancel("missing"));

        root.cancel();
        assert!(b.token().is_cancelled());
    }
}
