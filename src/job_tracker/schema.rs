//! SQLite schema for the durable job table.
//!
//! The table is shared with the execution engine, which writes rows for the
//! same `job_id`s on its own, so `job_id` is the primary key and every
//! registration is an upsert.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

pub const JOBS_TABLE_NAME: &str = "background_jobs";

// =============================================================================
// Version 1 - Job rows
// =============================================================================

const BACKGROUND_JOBS_TABLE_V1: Table = Table {
    name: JOBS_TABLE_NAME,
    columns: &[
        sqlite_column!("job_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("operation_type", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Text),
        sqlite_column!("completed_at", &SqlType::Text),
        sqlite_column!("result", &SqlType::Text),
        sqlite_column!("error", &SqlType::Text),
        sqlite_column!(
            "progress",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("username", &SqlType::Text, non_null = true),
        sqlite_column!("repo_alias", &SqlType::Text),
        sqlite_column!("progress_info", &SqlType::Text),
        sqlite_column!("metadata", &SqlType::Text),
    ],
    indices: &[
        ("idx_background_jobs_status", "status"),
        ("idx_background_jobs_created_at", "created_at"),
        (
            "idx_background_jobs_type_completed",
            "operation_type, completed_at",
        ),
    ],
};

pub const JOBS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[BACKGROUND_JOBS_TABLE_V1],
    migration: None,
}];
