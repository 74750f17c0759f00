//! Common test infrastructure
//!
//! Every test gets its own database file in a temporary directory. The
//! directory lives as long as the [`TestTracker`] that owns it.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::TestTracker;
//!
//! #[test]
//! fn test_register() {
//!     let test = TestTracker::new();
//!     test.tracker.register_job("job-1", "reindex", "alice", None, None).unwrap();
//! }
//! ```

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use code_index_jobs::{JobStatus, JobStore, JobTracker, SqliteJobStore, TrackedJob};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestTracker {
    pub tracker: JobTracker,
    pub store: Arc<SqliteJobStore>,
    pub db_path: PathBuf,
    _temp_dir: TempDir, // Keep temp dir alive
}

impl TestTracker {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("jobs.db");
        let store = Arc::new(SqliteJobStore::new(&db_path).expect("Failed to open job store"));
        Self {
            tracker: JobTracker::new(store.clone()),
            store,
            db_path,
            _temp_dir: temp_dir,
        }
    }

    /// A second, independent connection to the same database, standing in for
    /// the execution engine that writes job rows on its own.
    pub fn external_writer(&self) -> SqliteJobStore {
        SqliteJobStore::new(&self.db_path).expect("Failed to open second job store")
    }

    /// Simulates a tracker built by a freshly restarted process.
    pub fn restarted_tracker(&self) -> JobTracker {
        JobTracker::new(Arc::new(self.external_writer()))
    }
}

/// Write a row directly to the store, bypassing the tracker.
pub fn seed_job(
    store: &dyn JobStore,
    job_id: &str,
    operation_type: &str,
    status: JobStatus,
    completed_at: Option<DateTime<Utc>>,
) -> TrackedJob {
    let mut job = TrackedJob::new_pending(job_id, operation_type, "seed", None, None);
    job.status = status;
    job.completed_at = completed_at;
    if let Some(completed_at) = completed_at {
        job.created_at = completed_at;
    }
    store.upsert_job(&job).expect("Failed to seed job");
    job
}
