//! Background job tracking for the code-index server.
//!
//! This library exposes the tracker, its SQLite store and the maintenance
//! hooks used by the server bootstrap and the `jobs-admin` tool.

pub mod config;
pub mod job_tracker;
pub mod maintenance;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use job_tracker::{
    DuplicateJobError, JobQuery, JobStatus, JobStore, JobTracker, JobUpdate, SqliteJobStore,
    TimeFilter, TrackedJob, TrackedOperation, TrackerError,
};
