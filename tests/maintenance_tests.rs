//! Startup recovery, retention and history queries over a populated table.

mod common;

use chrono::{Duration, Utc};
use code_index_jobs::job_tracker::{RetentionPolicy, ORPHANED_JOB_ERROR};
use code_index_jobs::maintenance::run_startup_recovery;
use code_index_jobs::{JobQuery, JobStatus, JobStore, TimeFilter};
use common::{seed_job, TestTracker};
use std::collections::HashMap;

#[test]
fn test_orphan_recovery_after_restart() {
    let test = TestTracker::new();
    let finished_at = Utc::now() - Duration::hours(2);
    seed_job(test.store.as_ref(), "run-1", "reindex", JobStatus::Running, None);
    seed_job(test.store.as_ref(), "run-2", "git_pull", JobStatus::Running, None);
    seed_job(test.store.as_ref(), "pend-1", "reindex", JobStatus::Pending, None);
    seed_job(test.store.as_ref(), "done", "reindex", JobStatus::Completed, Some(finished_at));
    seed_job(test.store.as_ref(), "cancelled", "reindex", JobStatus::Cancelled, Some(finished_at));

    let restarted = test.restarted_tracker();
    assert_eq!(run_startup_recovery(&restarted).unwrap(), 3);

    for job_id in ["run-1", "run-2", "pend-1"] {
        let job = test.store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(ORPHANED_JOB_ERROR));
        assert!(job.completed_at.is_some());
    }

    let done = test.store.get_job("done").unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.error.is_none());
    assert_eq!(
        done.completed_at.map(|t| t.timestamp_micros()),
        Some(finished_at.timestamp_micros())
    );
    let cancelled = test.store.get_job("cancelled").unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // A second pass finds nothing left to recover
    assert_eq!(restarted.cleanup_orphaned_jobs_on_startup().unwrap(), 0);
}

#[test]
fn test_retention_deletes_only_expired_finished_jobs_of_type() {
    let test = TestTracker::new();
    let store = test.store.as_ref();
    let old = Utc::now() - Duration::hours(48);
    let recent = Utc::now() - Duration::hours(1);

    seed_job(store, "t-completed-old", "T", JobStatus::Completed, Some(old));
    seed_job(store, "t-failed-old", "T", JobStatus::Failed, Some(old));
    seed_job(store, "t-cancelled-old", "T", JobStatus::Cancelled, Some(old));
    seed_job(store, "t-completed-recent", "T", JobStatus::Completed, Some(recent));
    let mut stuck = seed_job(store, "t-running-old", "T", JobStatus::Running, None);
    stuck.created_at = old;
    store.upsert_job(&stuck).unwrap();
    seed_job(store, "u-completed-old", "U", JobStatus::Completed, Some(old));

    assert_eq!(test.tracker.cleanup_old_jobs("T", 24).unwrap(), 3);

    for gone in ["t-completed-old", "t-failed-old", "t-cancelled-old"] {
        assert!(store.get_job(gone).unwrap().is_none(), "{gone} should be deleted");
    }
    for kept in ["t-completed-recent", "t-running-old", "u-completed-old"] {
        assert!(store.get_job(kept).unwrap().is_some(), "{kept} should survive");
    }
}

#[test]
fn test_retention_policy_per_operation_type() {
    let test = TestTracker::new();
    let store = test.store.as_ref();
    let ten_hours_ago = Utc::now() - Duration::hours(10);
    seed_job(store, "reindex-old", "reindex", JobStatus::Completed, Some(ten_hours_ago));
    seed_job(store, "pull-old", "git_pull", JobStatus::Completed, Some(ten_hours_ago));

    let policy = RetentionPolicy {
        default_hours: 24,
        per_operation: HashMap::from([("git_pull".to_string(), 6)]),
    };
    assert_eq!(test.tracker.cleanup_old_jobs_all(&policy).unwrap(), 1);

    assert!(store.get_job("reindex-old").unwrap().is_some());
    assert!(store.get_job("pull-old").unwrap().is_none());
}

#[test]
fn test_recent_jobs_merge_live_and_history() {
    let test = TestTracker::new();
    test.tracker
        .register_job("live", "reindex", "alice", Some("repoA"), None)
        .unwrap();

    let engine = test.external_writer();
    seed_job(&engine, "recent-done", "git_pull", JobStatus::Completed, Some(Utc::now()));
    seed_job(
        &engine,
        "old-done",
        "git_pull",
        JobStatus::Completed,
        Some(Utc::now() - Duration::hours(3)),
    );

    let recent = test.tracker.get_recent_jobs(10, TimeFilter::OneHour).unwrap();
    let mut ids: Vec<_> = recent.iter().map(|job| job.job_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["live", "recent-done"]);

    let everything = test.tracker.get_recent_jobs(10, TimeFilter::All).unwrap();
    assert_eq!(everything.len(), 3);
}

#[test]
fn test_recent_jobs_ignore_untracked_running_rows() {
    let test = TestTracker::new();
    let engine = test.external_writer();
    seed_job(&engine, "engine-running", "reindex", JobStatus::Running, None);
    seed_job(&engine, "engine-pending", "git_pull", JobStatus::Pending, None);
    seed_job(&engine, "engine-done", "git_pull", JobStatus::Failed, Some(Utc::now()));

    let recent = test.tracker.get_recent_jobs(10, TimeFilter::OneHour).unwrap();
    let ids: Vec<_> = recent.iter().map(|job| job.job_id.as_str()).collect();
    assert_eq!(ids, vec!["engine-done"]);
    assert!(test.tracker.get_active_jobs().is_empty());
}

#[test]
fn test_query_history_filters() {
    let test = TestTracker::new();
    let tracker = &test.tracker;
    tracker
        .register_job("a", "reindex", "alice", Some("repoA"), None)
        .unwrap();
    tracker
        .register_job("b", "reindex", "alice", Some("repoB"), None)
        .unwrap();
    tracker
        .register_job("c", "git_pull", "alice", Some("repoA"), None)
        .unwrap();
    tracker.fail_job("b", "disk full").unwrap();

    let failed = tracker
        .query_jobs(
            &JobQuery {
                status: Some(JobStatus::Failed),
                ..Default::default()
            },
            10,
        )
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job_id, "b");

    let repo_a_reindex = tracker
        .query_jobs(
            &JobQuery {
                operation_type: Some("reindex".to_string()),
                repo_alias: Some("repoA".to_string()),
                ..Default::default()
            },
            10,
        )
        .unwrap();
    assert_eq!(repo_a_reindex.len(), 1);
    assert_eq!(repo_a_reindex[0].job_id, "a");

    let counts = tracker.stored_status_counts().unwrap();
    assert!(counts.contains(&(JobStatus::Pending, 2)));
    assert!(counts.contains(&(JobStatus::Failed, 1)));
}
