//! Declarative SQLite schema definitions shared by every store in the crate.
//!
//! Each store describes its tables as a list of [`VersionedSchema`]s. A fresh
//! database is created at the latest version; an existing one is validated
//! against the version recorded in `PRAGMA user_version` and migrated forward.

mod versioned_schema;

pub use versioned_schema::{open_versioned, Column, SqlType, Table, VersionedSchema};

/// Offset added to every schema version written to `PRAGMA user_version`, so a
/// database that was never touched by this crate (user_version = 0) is rejected.
pub const BASE_DB_VERSION: usize = 2000;
