use super::error::{DuplicateJobError, TrackerError};
use super::models::{
    JobData, JobQuery, JobStatus, JobUpdate, RetentionPolicy, StatusUpdate, TimeFilter,
    TrackedJob,
};
use super::store::JobStore;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error recorded on jobs that were still pending/running when the server
/// went down.
pub const ORPHANED_JOB_ERROR: &str = "orphaned - server restarted";

/// Fresh random job id for producers that do not bring their own.
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lifecycle view over every background job.
///
/// Active (pending/running) jobs live in an in-memory map; every job also has
/// a row in the [`JobStore`], which the execution engine writes to as well.
/// The map lock is never held across a store call: mutations snapshot under
/// the lock, release it, then persist the snapshot.
pub struct JobTracker {
    store: Arc<dyn JobStore>,
    active_jobs: Mutex<HashMap<String, TrackedJob>>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            active_jobs: Mutex::new(HashMap::new()),
        }
    }

    // The map only holds plain data, a panic mid-update cannot leave it torn
    fn jobs(&self) -> MutexGuard<'_, HashMap<String, TrackedJob>> {
        self.active_jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist a new pending job, then start tracking it in memory.
    ///
    /// The row is upserted: the execution engine may already have written a
    /// row for `job_id`, and registration must succeed either way. Store
    /// errors propagate and the job is not tracked.
    pub fn register_job(
        &self,
        job_id: &str,
        operation_type: &str,
        username: &str,
        repo_alias: Option<&str>,
        metadata: Option<JobData>,
    ) -> Result<TrackedJob, TrackerError> {
        let job = TrackedJob::new_pending(
            job_id,
            operation_type,
            username,
            repo_alias.map(str::to_string),
            metadata,
        );
        self.store.upsert_job(&job)?;
        self.jobs().insert(job.job_id.clone(), job.clone());

        info!(
            "Registered job {} ({}) for {} on {:?}",
            job_id, operation_type, username, repo_alias
        );
        Ok(job)
    }

    /// Like [`register_job`](Self::register_job), but the conflict check and
    /// the in-memory insert happen under one lock hold, so two callers racing
    /// for the same `(operation_type, repo_alias)` cannot both get through.
    pub fn register_job_exclusive(
        &self,
        job_id: &str,
        operation_type: &str,
        username: &str,
        repo_alias: Option<&str>,
        metadata: Option<JobData>,
    ) -> Result<TrackedJob, TrackerError> {
        let job = TrackedJob::new_pending(
            job_id,
            operation_type,
            username,
            repo_alias.map(str::to_string),
            metadata,
        );
        {
            let mut jobs = self.jobs();
            if let Some(conflict) = find_conflict(&jobs, operation_type, repo_alias) {
                return Err(conflict.into());
            }
            jobs.insert(job.job_id.clone(), job.clone());
        }

        if let Err(e) = self.store.upsert_job(&job) {
            self.jobs().remove(job_id);
            return Err(e.into());
        }

        info!(
            "Registered exclusive job {} ({}) for {} on {:?}",
            job_id, operation_type, username, repo_alias
        );
        Ok(job)
    }

    /// Apply `update` to a tracked job and persist the result.
    ///
    /// The first transition to running stamps `started_at`. A running job
    /// never goes back to pending. Terminal statuses are ignored here; use
    /// [`complete_job`](Self::complete_job) or [`fail_job`](Self::fail_job).
    /// Unknown ids are a logged no-op.
    pub fn update_status(&self, job_id: &str, update: JobUpdate) -> Result<(), TrackerError> {
        let snapshot = {
            let mut jobs = self.jobs();
            let Some(job) = jobs.get_mut(job_id) else {
                warn!("update_status: job {} is not tracked, ignoring", job_id);
                return Ok(());
            };

            match update.status {
                Some(status) if status.is_terminal() => {
                    warn!(
                        "update_status: refusing terminal status {} for job {}",
                        status, job_id
                    );
                }
                Some(JobStatus::Pending) if job.status == JobStatus::Running => {
                    warn!(
                        "update_status: job {} is already running, refusing to move it back to pending",
                        job_id
                    );
                }
                Some(status) => {
                    if status == JobStatus::Running && job.started_at.is_none() {
                        job.started_at = Some(Utc::now());
                    }
                    job.status = status;
                }
                None => {}
            }
            if let Some(progress) = update.progress {
                job.progress = progress.min(100);
            }
            if let Some(progress_info) = update.progress_info {
                job.progress_info = Some(progress_info);
            }
            if let Some(metadata) = update.metadata {
                job.metadata
                    .get_or_insert_with(JobData::new)
                    .extend(metadata);
            }
            StatusUpdate::from(&*job)
        };

        debug!(
            "Job {} now {} at {}%",
            job_id,
            snapshot.status,
            snapshot.progress
        );
        let updated = self.store.update_job_status(job_id, &snapshot)?;
        if updated == 0 {
            warn!(
                "Job {} has no active row in the store, status update not persisted",
                job_id
            );
        }
        Ok(())
    }

    /// Mark a tracked job completed and stop tracking it.
    pub fn complete_job(&self, job_id: &str, result: Option<JobData>) -> Result<(), TrackerError> {
        let Some(mut job) = self.jobs().remove(job_id) else {
            warn!("complete_job: job {} is not tracked, ignoring", job_id);
            return Ok(());
        };

        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.progress = 100;
        job.result = result;
        self.persist_final(&job)?;

        info!("Job {} ({}) completed", job_id, job.operation_type);
        Ok(())
    }

    /// Mark a tracked job failed and stop tracking it.
    pub fn fail_job(&self, job_id: &str, error: &str) -> Result<(), TrackerError> {
        let Some(mut job) = self.jobs().remove(job_id) else {
            warn!("fail_job: job {} is not tracked, ignoring", job_id);
            return Ok(());
        };

        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.error = Some(error.to_string());
        self.persist_final(&job)?;

        warn!("Job {} ({}) failed: {}", job_id, job.operation_type, error);
        Ok(())
    }

    fn persist_final(&self, job: &TrackedJob) -> Result<(), TrackerError> {
        if self.store.finish_job(job)? == 0 {
            warn!(
                "Job {} was already finished (or removed) in the store, keeping stored state",
                job.job_id
            );
        }
        Ok(())
    }

    /// Memory first, then the store.
    pub fn get_job(&self, job_id: &str) -> Result<Option<TrackedJob>, TrackerError> {
        if let Some(job) = self.jobs().get(job_id) {
            return Ok(Some(job.clone()));
        }
        Ok(self.store.get_job(job_id)?)
    }

    /// Snapshot of every pending/running job tracked in memory.
    pub fn get_active_jobs(&self) -> Vec<TrackedJob> {
        self.jobs().values().cloned().collect()
    }

    /// Every tracked job (regardless of `time_filter`) plus up to `limit`
    /// finished stored jobs created inside the window, newest first. Stored
    /// pending/running rows are never reported, the live set is memory only. When a job is both
    /// tracked and stored, the tracked copy wins.
    pub fn get_recent_jobs(
        &self,
        limit: usize,
        time_filter: TimeFilter,
    ) -> Result<Vec<TrackedJob>, TrackerError> {
        let mut jobs = self.get_active_jobs();
        let cutoff = time_filter.cutoff(Utc::now());

        // Over-fetch so that dropping tracked duplicates still leaves `limit` rows
        let stored = self
            .store
            .list_finished_jobs_created_since(cutoff, limit.saturating_add(jobs.len()))?;

        let tracked_ids: HashSet<String> = jobs.iter().map(|j| j.job_id.clone()).collect();
        jobs.extend(
            stored
                .into_iter()
                .filter(|j| !tracked_ids.contains(&j.job_id))
                .take(limit),
        );
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Store-only history query; tracked jobs may show a stale snapshot here.
    pub fn query_jobs(&self, query: &JobQuery, limit: usize) -> Result<Vec<TrackedJob>, TrackerError> {
        Ok(self.store.query_jobs(query, limit)?)
    }

    /// Fails with [`DuplicateJobError`] if a pending/running job already exists
    /// for the pair. Advisory: nothing stops a concurrent registration between
    /// this check and the caller's own `register_job`.
    pub fn check_operation_conflict(
        &self,
        operation_type: &str,
        repo_alias: Option<&str>,
    ) -> Result<(), DuplicateJobError> {
        match find_conflict(&self.jobs(), operation_type, repo_alias) {
            Some(conflict) => Err(conflict),
            None => Ok(()),
        }
    }

    /// Fail every pending/running row left behind by a previous process.
    ///
    /// Must run once at startup, before any job is registered: with an empty
    /// map every active row in the store is orphaned by construction.
    pub fn cleanup_orphaned_jobs_on_startup(&self) -> Result<usize, TrackerError> {
        let tracked = self.jobs().len();
        if tracked > 0 {
            warn!(
                "Orphan cleanup running with {} jobs already tracked; their rows will be failed too",
                tracked
            );
        }

        let count = self.store.fail_active_jobs(ORPHANED_JOB_ERROR, Utc::now())?;
        if count > 0 {
            warn!("Marked {} orphaned jobs as failed", count);
        } else {
            info!("No orphaned jobs found");
        }
        Ok(count)
    }

    /// Delete finished `operation_type` jobs completed more than
    /// `max_age_hours` ago. Returns the number of stored rows deleted.
    pub fn cleanup_old_jobs(
        &self,
        operation_type: &str,
        max_age_hours: u64,
    ) -> Result<usize, TrackerError> {
        // Ages beyond chrono's range mean "keep everything"
        let cutoff = i64::try_from(max_age_hours)
            .ok()
            .and_then(Duration::try_hours)
            .and_then(|max_age| Utc::now().checked_sub_signed(max_age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let deleted = self.store.delete_finished_jobs(operation_type, cutoff)?;

        // Terminal jobs leave the map on completion, this should find nothing
        let evicted = {
            let mut jobs = self.jobs();
            let before = jobs.len();
            jobs.retain(|_, job| {
                !(job.operation_type == operation_type
                    && job.status.is_terminal()
                    && job.completed_at.is_some_and(|t| t < cutoff))
            });
            before - jobs.len()
        };
        if evicted > 0 {
            warn!(
                "Evicted {} finished {} jobs still held in memory",
                evicted, operation_type
            );
        }

        if deleted > 0 {
            info!(
                "Deleted {} {} jobs older than {}h",
                deleted, operation_type, max_age_hours
            );
        }
        Ok(deleted)
    }

    /// Apply [`cleanup_old_jobs`](Self::cleanup_old_jobs) to every operation
    /// type present in the store (and every type named by the policy).
    pub fn cleanup_old_jobs_all(&self, policy: &RetentionPolicy) -> Result<usize, TrackerError> {
        let mut operation_types = self.store.distinct_operation_types()?;
        for operation_type in policy.per_operation.keys() {
            if !operation_types.contains(operation_type) {
                operation_types.push(operation_type.clone());
            }
        }

        let mut total = 0;
        for operation_type in &operation_types {
            total += self.cleanup_old_jobs(operation_type, policy.hours_for(operation_type))?;
        }
        Ok(total)
    }

    /// Tracked jobs in `running` state (pending ones are not counted).
    pub fn get_active_job_count(&self) -> usize {
        self.count_tracked(JobStatus::Running)
    }

    /// Tracked jobs still waiting in `pending` state.
    pub fn get_pending_job_count(&self) -> usize {
        self.count_tracked(JobStatus::Pending)
    }

    fn count_tracked(&self, status: JobStatus) -> usize {
        self.jobs().values().filter(|j| j.status == status).count()
    }

    /// Row counts per status in the store, including finished jobs.
    pub fn stored_status_counts(&self) -> Result<Vec<(JobStatus, usize)>, TrackerError> {
        Ok(self.store.count_by_status()?)
    }
}

fn find_conflict(
    jobs: &HashMap<String, TrackedJob>,
    operation_type: &str,
    repo_alias: Option<&str>,
) -> Option<DuplicateJobError> {
    jobs.values()
        .find(|job| {
            job.operation_type == operation_type
                && job.repo_alias.as_deref() == repo_alias
                && job.status.is_active()
        })
        .map(|job| DuplicateJobError {
            operation_type: operation_type.to_string(),
            repo_alias: repo_alias.map(str::to_string),
            existing_job_id: job.job_id.clone(),
        })
}
