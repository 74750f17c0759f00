use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

/// Structured data attached to a job by its producer (`metadata`) or by a
/// successful completion (`result`).
pub type JobData = Map<String, Value>;

/// Lifecycle state of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Only ever written by the execution engine, never by the tracker itself.
    Cancelled,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 3] =
        [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Pending or running.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time window accepted by recent-jobs listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeFilter {
    OneHour,
    #[default]
    OneDay,
    SevenDays,
    ThirtyDays,
    All,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::OneHour => "1h",
            TimeFilter::OneDay => "24h",
            TimeFilter::SevenDays => "7d",
            TimeFilter::ThirtyDays => "30d",
            TimeFilter::All => "all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(TimeFilter::OneHour),
            "24h" => Some(TimeFilter::OneDay),
            "7d" => Some(TimeFilter::SevenDays),
            "30d" => Some(TimeFilter::ThirtyDays),
            "all" => Some(TimeFilter::All),
            _ => None,
        }
    }

    /// Oldest `created_at` still inside the window, `None` for [`TimeFilter::All`].
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let window = match self {
            TimeFilter::OneHour => Duration::hours(1),
            TimeFilter::OneDay => Duration::hours(24),
            TimeFilter::SevenDays => Duration::days(7),
            TimeFilter::ThirtyDays => Duration::days(30),
            TimeFilter::All => return None,
        };
        Some(now - window)
    }
}

impl std::str::FromStr for TimeFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| {
            format!(
                "invalid time filter '{}' (expected 1h, 24h, 7d, 30d or all)",
                s
            )
        })
    }
}

/// Lifecycle record of one background job.
///
/// Serializes to the caller-facing map shape: timestamps as ISO-8601 strings,
/// `metadata`/`result` as nested JSON objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedJob {
    pub job_id: String,
    pub operation_type: String,
    pub status: JobStatus,
    pub username: String,
    pub repo_alias: Option<String>,
    /// 0 to 100.
    pub progress: u8,
    pub progress_info: Option<String>,
    pub metadata: Option<JobData>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<JobData>,
}

impl TrackedJob {
    /// A freshly registered job: pending, no progress, created now.
    pub fn new_pending(
        job_id: impl Into<String>,
        operation_type: impl Into<String>,
        username: impl Into<String>,
        repo_alias: Option<String>,
        metadata: Option<JobData>,
    ) -> Self {
        TrackedJob {
            job_id: job_id.into(),
            operation_type: operation_type.into(),
            status: JobStatus::Pending,
            username: username.into(),
            repo_alias,
            progress: 0,
            progress_info: None,
            metadata,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        }
    }

    /// Caller-facing map representation.
    pub fn to_map(&self) -> JobData {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // A struct of strings, integers and maps always serializes to an object
            _ => JobData::new(),
        }
    }

    pub fn to_row(&self) -> JobRow {
        JobRow {
            job_id: self.job_id.clone(),
            operation_type: self.operation_type.clone(),
            status: self.status.as_str().to_string(),
            created_at: format_timestamp(&self.created_at),
            started_at: self.started_at.as_ref().map(format_timestamp),
            completed_at: self.completed_at.as_ref().map(format_timestamp),
            result: self.result.as_ref().map(encode_data),
            error: self.error.clone(),
            progress: i64::from(self.progress),
            username: self.username.clone(),
            repo_alias: self.repo_alias.clone(),
            progress_info: self.progress_info.clone(),
            metadata: self.metadata.as_ref().map(encode_data),
        }
    }

    /// Decode a stored row. Returns `None` (with a warning) when the row is
    /// unusable: unknown status or unparseable `created_at`. Broken optional
    /// fields are dropped individually so one bad value never hides the job.
    pub fn from_row(row: JobRow) -> Option<Self> {
        let Some(status) = JobStatus::parse(&row.status) else {
            warn!("Skipping job {} with unknown status '{}'", row.job_id, row.status);
            return None;
        };
        let Some(created_at) = parse_timestamp(&row.created_at) else {
            warn!(
                "Skipping job {} with unparseable created_at '{}'",
                row.job_id, row.created_at
            );
            return None;
        };

        let metadata = row
            .metadata
            .as_deref()
            .and_then(|raw| decode_data(&row.job_id, "metadata", raw));
        let result = row
            .result
            .as_deref()
            .and_then(|raw| decode_data(&row.job_id, "result", raw));

        Some(TrackedJob {
            status,
            created_at,
            started_at: row.started_at.as_deref().and_then(parse_timestamp),
            completed_at: row.completed_at.as_deref().and_then(parse_timestamp),
            progress: row.progress.clamp(0, 100) as u8,
            metadata,
            result,
            job_id: row.job_id,
            operation_type: row.operation_type,
            username: row.username,
            repo_alias: row.repo_alias,
            progress_info: row.progress_info,
            error: row.error,
        })
    }
}

/// One row of the `background_jobs` table, exactly as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub job_id: String,
    pub operation_type: String,
    pub status: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub progress: i64,
    pub username: String,
    pub repo_alias: Option<String>,
    pub progress_info: Option<String>,
    pub metadata: Option<String>,
}

/// Requested change to a tracked job. Unset fields are left as they are;
/// `metadata` keys are merged into the existing metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub progress_info: Option<String>,
    pub metadata: Option<JobData>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        JobUpdate {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8, progress_info: impl Into<String>) -> Self {
        JobUpdate {
            progress: Some(progress),
            progress_info: Some(progress_info.into()),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: JobData) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Field snapshot persisted by a non-terminal status update.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub progress: u8,
    pub progress_info: Option<String>,
    pub metadata: Option<JobData>,
    pub started_at: Option<DateTime<Utc>>,
}

impl From<&TrackedJob> for StatusUpdate {
    fn from(job: &TrackedJob) -> Self {
        StatusUpdate {
            status: job.status,
            progress: job.progress,
            progress_info: job.progress_info.clone(),
            metadata: job.metadata.clone(),
            started_at: job.started_at,
        }
    }
}

/// Optional equality filters for history browsing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobQuery {
    pub operation_type: Option<String>,
    pub status: Option<JobStatus>,
    pub repo_alias: Option<String>,
}

/// How long finished jobs are kept, per operation type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub default_hours: u64,
    pub per_operation: HashMap<String, u64>,
}

impl RetentionPolicy {
    pub fn hours_for(&self, operation_type: &str) -> u64 {
        self.per_operation
            .get(operation_type)
            .copied()
            .unwrap_or(self.default_hours)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            default_hours: 7 * 24,
            per_operation: HashMap::new(),
        }
    }
}

/// Fixed-width UTC timestamps so that string comparison in SQL matches
/// chronological order.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn encode_data(data: &JobData) -> String {
    Value::Object(data.clone()).to_string()
}

fn decode_data(job_id: &str, field: &str, raw: &str) -> Option<JobData> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        Ok(Value::Null) => None,
        Ok(other) => {
            warn!("Ignoring non-object {} on job {}: {}", field, job_id, other);
            None
        }
        Err(e) => {
            warn!("Ignoring malformed {} on job {}: {}", field, job_id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> TrackedJob {
        let mut metadata = JobData::new();
        metadata.insert("branch".to_string(), json!("main"));
        TrackedJob::new_pending(
            "job-1",
            "reindex",
            "alice",
            Some("repoA".to_string()),
            Some(metadata),
        )
    }

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("paused"), None);

        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Running.is_active());
    }

    #[test]
    fn test_time_filter_cutoffs() {
        let now = Utc::now();
        assert_eq!(
            TimeFilter::OneHour.cutoff(now),
            Some(now - Duration::hours(1))
        );
        assert_eq!(
            TimeFilter::ThirtyDays.cutoff(now),
            Some(now - Duration::days(30))
        );
        assert_eq!(TimeFilter::All.cutoff(now), None);
        assert_eq!(TimeFilter::parse("7d"), Some(TimeFilter::SevenDays));
        assert!("2w".parse::<TimeFilter>().is_err());
    }

    #[test]
    fn test_row_conversion_preserves_fields() {
        let mut job = sample_job();
        job.status = JobStatus::Completed;
        job.started_at = Some(job.created_at);
        job.completed_at = Some(Utc::now());
        let mut result = JobData::new();
        result.insert("files".to_string(), json!(10));
        job.result = Some(result);
        job.progress = 100;

        let row = job.to_row();
        assert_eq!(row.status, "completed");
        assert_eq!(row.progress, 100);

        let decoded = TrackedJob::from_row(row).unwrap();
        // Stored timestamps carry microsecond precision
        assert_eq!(
            format_timestamp(&decoded.created_at),
            format_timestamp(&job.created_at)
        );
        assert_eq!(decoded.result, job.result);
        assert_eq!(decoded.metadata, job.metadata);
        assert_eq!(decoded.repo_alias.as_deref(), Some("repoA"));
    }

    #[test]
    fn test_malformed_json_fields_are_dropped() {
        let mut row = sample_job().to_row();
        row.metadata = Some("{not json".to_string());
        row.result = Some("[1, 2]".to_string());

        let job = TrackedJob::from_row(row).unwrap();
        assert_eq!(job.metadata, None);
        assert_eq!(job.result, None);
    }

    #[test]
    fn test_unusable_rows_are_rejected() {
        let mut row = sample_job().to_row();
        row.status = "exploded".to_string();
        assert!(TrackedJob::from_row(row).is_none());

        let mut row = sample_job().to_row();
        row.created_at = "yesterday".to_string();
        assert!(TrackedJob::from_row(row).is_none());
    }

    #[test]
    fn test_map_shape() {
        let map = sample_job().to_map();
        assert_eq!(map["status"], json!("pending"));
        assert_eq!(map["metadata"]["branch"], json!("main"));
        assert!(map["created_at"].is_string());
        assert!(map["completed_at"].is_null());
    }

    #[test]
    fn test_retention_policy_lookup() {
        let mut policy = RetentionPolicy::default();
        policy.per_operation.insert("reindex".to_string(), 72);
        assert_eq!(policy.hours_for("reindex"), 72);
        assert_eq!(policy.hours_for("git_pull"), 168);
    }

    #[test]
    fn test_timestamp_format_sorts_chronologically() {
        let earlier = parse_timestamp("2024-01-01T09:00:00Z").unwrap();
        let later = parse_timestamp("2024-01-01T10:00:00.5+00:00").unwrap();
        assert!(format_timestamp(&earlier) < format_timestamp(&later));
        assert!(format_timestamp(&later).ends_with('Z'));
    }
}
