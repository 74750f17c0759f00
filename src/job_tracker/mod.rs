//! Lifecycle tracking for background jobs (reindexing, description refresh,
//! git operations, analysis runs).
//!
//! Producers register a job, move it to running, and finish it exactly once;
//! dashboards read live and historical state through the same tracker. Live
//! jobs are indexed in memory, all jobs are persisted in a SQLite table that
//! the execution engine also writes to directly.

mod error;
mod models;
mod operation;
mod schema;
mod store;
mod tracker;

pub use error::{DuplicateJobError, TrackerError};
pub use models::{
    format_timestamp, parse_timestamp, JobData, JobQuery, JobRow, JobStatus, JobUpdate,
    RetentionPolicy, StatusUpdate, TimeFilter, TrackedJob,
};
pub use operation::TrackedOperation;
pub use schema::{JOBS_TABLE_NAME, JOBS_VERSIONED_SCHEMAS};
pub use store::{JobStore, SqliteJobStore};
pub use tracker::{new_job_id, JobTracker, ORPHANED_JOB_ERROR};
