use thiserror::Error;

/// Another job for the same `(operation_type, repo_alias)` pair is still
/// pending or running. A policy conflict, not a system fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Duplicate job: {operation_type} for {} (existing: {existing_job_id})", display_alias(.repo_alias))]
pub struct DuplicateJobError {
    pub operation_type: String,
    pub repo_alias: Option<String>,
    pub existing_job_id: String,
}

fn display_alias(repo_alias: &Option<String>) -> &str {
    repo_alias.as_deref().unwrap_or("None")
}

/// Errors surfaced by [`JobTracker`](super::JobTracker).
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Duplicate(#[from] DuplicateJobError),

    #[error("Job store error: {0}")]
    Store(#[from] anyhow::Error),
}
