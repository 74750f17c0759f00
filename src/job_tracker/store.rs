//! Durable storage for job rows.
//!
//! The table behind [`JobStore`] is also written directly by the execution
//! engine, so every write here is a single statement keyed by `job_id` and
//! nothing assumes this process is the only writer.

use super::models::{
    format_timestamp, JobQuery, JobRow, JobStatus, StatusUpdate, TrackedJob,
};
use super::schema::{JOBS_TABLE_NAME, JOBS_VERSIONED_SCHEMAS};
use crate::sqlite_persistence::open_versioned;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::warn;

/// SQL list of terminal statuses, used to keep terminal rows sticky.
const TERMINAL_STATUSES_SQL: &str = "('completed', 'failed', 'cancelled')";
const ACTIVE_STATUSES_SQL: &str = "('pending', 'running')";

const JOB_COLUMNS: &str = "job_id, operation_type, status, created_at, started_at, completed_at, \
     result, error, progress, username, repo_alias, progress_info, metadata";

pub trait JobStore: Send + Sync {
    /// Insert the row, or overwrite every field if `job_id` already exists.
    fn upsert_job(&self, job: &TrackedJob) -> Result<()>;

    /// Persist a non-terminal snapshot. `started_at` is only filled if still
    /// empty. Rows already in a terminal state are left untouched, and a
    /// running row is never moved back to pending.
    /// Returns the number of rows updated.
    fn update_job_status(&self, job_id: &str, update: &StatusUpdate) -> Result<usize>;

    /// Persist the final state of a job. Rows already in a terminal state are
    /// left untouched. Returns the number of rows updated.
    fn finish_job(&self, job: &TrackedJob) -> Result<usize>;

    fn get_job(&self, job_id: &str) -> Result<Option<TrackedJob>>;

    /// Terminal rows created at or after `cutoff` (all of them if `None`),
    /// newest first.
    fn list_finished_jobs_created_since(
        &self,
        cutoff: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<TrackedJob>>;

    /// Rows matching every filter that is set, newest first.
    fn query_jobs(&self, query: &JobQuery, limit: usize) -> Result<Vec<TrackedJob>>;

    /// Fail every pending/running row in one statement. Returns the count.
    fn fail_active_jobs(&self, error: &str, completed_at: DateTime<Utc>) -> Result<usize>;

    /// Delete terminal rows of `operation_type` completed before `cutoff`.
    /// Returns the count.
    fn delete_finished_jobs(&self, operation_type: &str, cutoff: DateTime<Utc>)
        -> Result<usize>;

    fn distinct_operation_types(&self) -> Result<Vec<String>>;

    /// Number of rows per status, statuses with no rows omitted.
    fn count_by_status(&self) -> Result<Vec<(JobStatus, usize)>>;
}

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path.as_ref(), JOBS_VERSIONED_SCHEMAS, "jobs")?;
        // The execution engine may hold its own connection to the same file
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_to_job_row(row: &rusqlite::Row) -> rusqlite::Result<JobRow> {
        Ok(JobRow {
            job_id: row.get("job_id")?,
            operation_type: row.get("operation_type")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            result: row.get("result")?,
            error: row.get("error")?,
            progress: row.get::<_, Option<i64>>("progress")?.unwrap_or(0),
            username: row.get("username")?,
            repo_alias: row.get("repo_alias")?,
            progress_info: row.get("progress_info")?,
            metadata: row.get("metadata")?,
        })
    }

    /// Run a listing query, skipping (and logging) rows that cannot be decoded.
    fn collect_jobs(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<TrackedJob>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, Self::row_to_job_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            match row {
                Ok(job_row) => jobs.extend(TrackedJob::from_row(job_row)),
                Err(e) => warn!("Skipping unreadable job row: {}", e),
            }
        }
        Ok(jobs)
    }
}

impl JobStore for SqliteJobStore {
    fn upsert_job(&self, job: &TrackedJob) -> Result<()> {
        let row = job.to_row();
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO {JOBS_TABLE_NAME} ({JOB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(job_id) DO UPDATE SET
                    operation_type = excluded.operation_type,
                    status = excluded.status,
                    created_at = excluded.created_at,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    result = excluded.result,
                    error = excluded.error,
                    progress = excluded.progress,
                    username = excluded.username,
                    repo_alias = excluded.repo_alias,
                    progress_info = excluded.progress_info,
                    metadata = excluded.metadata"
            ),
            params![
                row.job_id,
                row.operation_type,
                row.status,
                row.created_at,
                row.started_at,
                row.completed_at,
                row.result,
                row.error,
                row.progress,
                row.username,
                row.repo_alias,
                row.progress_info,
                row.metadata,
            ],
        )?;
        Ok(())
    }

    fn update_job_status(&self, job_id: &str, update: &StatusUpdate) -> Result<usize> {
        let metadata = update
            .metadata
            .as_ref()
            .map(|m| serde_json::Value::Object(m.clone()).to_string());
        let started_at = update.started_at.as_ref().map(format_timestamp);

        let conn = self.conn();
        let count = conn.execute(
            &format!(
                "UPDATE {JOBS_TABLE_NAME}
                 SET status = ?1, progress = ?2, progress_info = ?3, metadata = ?4,
                     started_at = COALESCE(started_at, ?5)
                 WHERE job_id = ?6 AND status NOT IN {TERMINAL_STATUSES_SQL}
                   AND NOT (status = 'running' AND ?1 = 'pending')"
            ),
            params![
                update.status.as_str(),
                i64::from(update.progress),
                update.progress_info,
                metadata,
                started_at,
                job_id,
            ],
        )?;
        Ok(count)
    }

    fn finish_job(&self, job: &TrackedJob) -> Result<usize> {
        let row = job.to_row();
        let conn = self.conn();
        let count = conn.execute(
            &format!(
                "UPDATE {JOBS_TABLE_NAME}
                 SET status = ?1, completed_at = ?2, result = ?3, error = ?4,
                     progress = ?5, progress_info = ?6, metadata = ?7,
                     started_at = COALESCE(started_at, ?8)
                 WHERE job_id = ?9 AND status NOT IN {TERMINAL_STATUSES_SQL}"
            ),
            params![
                row.status,
                row.completed_at,
                row.result,
                row.error,
                row.progress,
                row.progress_info,
                row.metadata,
                row.started_at,
                row.job_id,
            ],
        )?;
        Ok(count)
    }

    fn get_job(&self, job_id: &str) -> Result<Option<TrackedJob>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM {JOBS_TABLE_NAME} WHERE job_id = ?1"),
                params![job_id],
                Self::row_to_job_row,
            )
            .optional()?;
        Ok(row.and_then(TrackedJob::from_row))
    }

    fn list_finished_jobs_created_since(
        &self,
        cutoff: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<TrackedJob>> {
        let conn = self.conn();
        let limit = limit as i64;
        match cutoff {
            Some(cutoff) => Self::collect_jobs(
                &conn,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM {JOBS_TABLE_NAME}
                     WHERE status IN {TERMINAL_STATUSES_SQL} AND created_at >= ?1
                     ORDER BY created_at DESC LIMIT ?2"
                ),
                params![format_timestamp(&cutoff), limit],
            ),
            None => Self::collect_jobs(
                &conn,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM {JOBS_TABLE_NAME}
                     WHERE status IN {TERMINAL_STATUSES_SQL}
                     ORDER BY created_at DESC LIMIT ?1"
                ),
                params![limit],
            ),
        }
    }

    fn query_jobs(&self, query: &JobQuery, limit: usize) -> Result<Vec<TrackedJob>> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(operation_type) = &query.operation_type {
            conditions.push("operation_type = ?");
            values.push(Box::new(operation_type.clone()));
        }
        if let Some(status) = query.status {
            conditions.push("status = ?");
            values.push(Box::new(status.as_str()));
        }
        if let Some(repo_alias) = &query.repo_alias {
            conditions.push("repo_alias = ?");
            values.push(Box::new(repo_alias.clone()));
        }
        values.push(Box::new(limit as i64));

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {JOBS_TABLE_NAME} {where_clause}
             ORDER BY created_at DESC LIMIT ?"
        );

        let params_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|p| p.as_ref()).collect();
        let conn = self.conn();
        Self::collect_jobs(&conn, &sql, &params_refs)
    }

    fn fail_active_jobs(&self, error: &str, completed_at: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let count = conn.execute(
            &format!(
                "UPDATE {JOBS_TABLE_NAME} SET status = ?1, error = ?2, completed_at = ?3
                 WHERE status IN {ACTIVE_STATUSES_SQL}"
            ),
            params![
                JobStatus::Failed.as_str(),
                error,
                format_timestamp(&completed_at)
            ],
        )?;
        Ok(count)
    }

    fn delete_finished_jobs(
        &self,
        operation_type: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.conn();
        let count = conn.execute(
            &format!(
                "DELETE FROM {JOBS_TABLE_NAME}
                 WHERE operation_type = ?1
                   AND status IN {TERMINAL_STATUSES_SQL}
                   AND completed_at IS NOT NULL
                   AND completed_at < ?2"
            ),
            params![operation_type, format_timestamp(&cutoff)],
        )?;
        Ok(count)
    }

    fn distinct_operation_types(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT operation_type FROM {JOBS_TABLE_NAME} ORDER BY operation_type"
        ))?;
        let types = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(types)
    }

    fn count_by_status(&self) -> Result<Vec<(JobStatus, usize)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM {JOBS_TABLE_NAME} GROUP BY status ORDER BY status"
        ))?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(counts
            .into_iter()
            .filter_map(|(status, count)| match JobStatus::parse(&status) {
                Some(status) => Some((status, count as usize)),
                None => {
                    warn!("Ignoring {} rows with unknown status '{}'", count, status);
                    None
                }
            })
            .collect())
    }
}
