//! Scoped "register, run, finish" bracket around [`JobTracker`].

use super::error::TrackerError;
use super::models::{JobData, JobStatus, JobUpdate, TrackedJob};
use super::tracker::JobTracker;
use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

const DROPPED_ERROR: &str = "operation dropped before completion";
const PANICKED_ERROR: &str = "operation panicked";

/// A registered, running job that is finished exactly once.
///
/// [`complete`](Self::complete) and [`fail`](Self::fail) consume the guard.
/// Dropping it any other way (early return, `?`, panic) fails the job.
pub struct TrackedOperation<'a> {
    tracker: &'a JobTracker,
    job: TrackedJob,
    finished: bool,
}

impl<'a> TrackedOperation<'a> {
    /// Register the job and move it straight to running.
    pub fn start(
        tracker: &'a JobTracker,
        job_id: &str,
        operation_type: &str,
        username: &str,
        repo_alias: Option<&str>,
        metadata: Option<JobData>,
    ) -> Result<Self, TrackerError> {
        let job = tracker.register_job(job_id, operation_type, username, repo_alias, metadata)?;
        let mut operation = TrackedOperation {
            tracker,
            job,
            finished: false,
        };

        if let Err(e) = tracker.update_status(job_id, JobUpdate::status(JobStatus::Running)) {
            operation.finish_failed(&e.to_string());
            return Err(e);
        }
        match tracker.get_job(job_id) {
            Ok(Some(job)) => operation.job = job,
            Ok(None) => {}
            Err(e) => {
                operation.finish_failed(&e.to_string());
                return Err(e);
            }
        }
        Ok(operation)
    }

    /// Run `body` as a tracked job. `Ok` completes the job with the returned
    /// result, `Err` fails it with the error's message and hands the same
    /// error back. A panic fails the job and keeps unwinding.
    pub fn run<E, F>(
        tracker: &'a JobTracker,
        job_id: &str,
        operation_type: &str,
        username: &str,
        repo_alias: Option<&str>,
        metadata: Option<JobData>,
        body: F,
    ) -> Result<Option<JobData>, E>
    where
        E: From<TrackerError> + Display,
        F: FnOnce(&TrackedOperation<'a>) -> Result<Option<JobData>, E>,
    {
        let operation =
            Self::start(tracker, job_id, operation_type, username, repo_alias, metadata)?;

        match panic::catch_unwind(AssertUnwindSafe(|| body(&operation))) {
            Ok(Ok(result)) => {
                operation.complete(result.clone())?;
                Ok(result)
            }
            Ok(Err(e)) => {
                operation.finish_failed(&e.to_string());
                Err(e)
            }
            Err(payload) => {
                let message = format!("{}: {}", PANICKED_ERROR, panic_message(&*payload));
                operation.finish_failed(&message);
                panic::resume_unwind(payload)
            }
        }
    }

    /// Snapshot of the job taken right after it started running.
    pub fn job(&self) -> &TrackedJob {
        &self.job
    }

    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }

    pub fn set_progress(
        &self,
        progress: u8,
        progress_info: impl Into<String>,
    ) -> Result<(), TrackerError> {
        self.tracker
            .update_status(&self.job.job_id, JobUpdate::progress(progress, progress_info))
    }

    pub fn complete(mut self, result: Option<JobData>) -> Result<(), TrackerError> {
        self.finished = true;
        self.tracker.complete_job(&self.job.job_id, result)
    }

    pub fn fail(mut self, error: &str) -> Result<(), TrackerError> {
        self.finished = true;
        self.tracker.fail_job(&self.job.job_id, error)
    }

    /// Fail the job, logging (not returning) a store error so the caller's
    /// original error is the one that propagates.
    fn finish_failed(mut self, message: &str) {
        self.finished = true;
        if let Err(e) = self.tracker.fail_job(&self.job.job_id, message) {
            error!("Failed to record failure of job {}: {}", self.job.job_id, e);
        }
    }
}

impl Drop for TrackedOperation<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let message = if std::thread::panicking() {
            PANICKED_ERROR
        } else {
            DROPPED_ERROR
        };
        if let Err(e) = self.tracker.fail_job(&self.job.job_id, message) {
            error!("Failed to record failure of job {}: {}", self.job.job_id, e);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
