mod file_config;

pub use file_config::FileConfig;

use crate::job_tracker::RetentionPolicy;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAINTENANCE_INTERVAL_MINUTES: u64 = 60;
pub const DEFAULT_RETENTION_HOURS: u64 = 7 * 24;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub maintenance_interval_minutes: u64,
    pub default_retention_hours: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            maintenance_interval_minutes: DEFAULT_MAINTENANCE_INTERVAL_MINUTES,
            default_retention_hours: DEFAULT_RETENTION_HOURS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub maintenance_interval: Duration,
    pub retention: RetentionPolicy,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        // The database file may not exist yet, its directory must
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }
        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }

        let interval_minutes = file
            .maintenance_interval_minutes
            .unwrap_or(cli.maintenance_interval_minutes);
        if interval_minutes == 0 {
            bail!("maintenance_interval_minutes must be greater than 0");
        }

        let default_hours = file
            .default_retention_hours
            .unwrap_or(cli.default_retention_hours);
        if default_hours == 0 {
            bail!("default_retention_hours must be greater than 0");
        }

        let per_operation = file.retention.unwrap_or_default();
        if let Some((operation_type, _)) = per_operation.iter().find(|(_, hours)| **hours == 0) {
            bail!(
                "retention for operation type '{}' must be greater than 0",
                operation_type
            );
        }

        Ok(Self {
            db_path,
            maintenance_interval: Duration::from_secs(interval_minutes * 60),
            retention: RetentionPolicy {
                default_hours,
                per_operation,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn cli_with_db(temp_dir: &TempDir) -> CliConfig {
        CliConfig {
            db_path: Some(temp_dir.path().join("jobs.db")),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = TempDir::new().unwrap();
        let config = AppConfig::resolve(&cli_with_db(&temp_dir), None).unwrap();

        assert_eq!(config.db_path, temp_dir.path().join("jobs.db"));
        assert_eq!(config.maintenance_interval, Duration::from_secs(3600));
        assert_eq!(config.retention.default_hours, DEFAULT_RETENTION_HOURS);
        assert!(config.retention.per_operation.is_empty());
    }

    #[test]
    fn test_toml_overrides_cli() {
        let temp_dir = TempDir::new().unwrap();
        let file_db = temp_dir.path().join("from_file.db");
        let file_config: FileConfig = toml::from_str(&format!(
            r#"
            db_path = "{}"
            maintenance_interval_minutes = 15
            default_retention_hours = 24

            [retention]
            reindex = 72
            description_refresh = 12
            "#,
            file_db.display()
        ))
        .unwrap();

        let config = AppConfig::resolve(&cli_with_db(&temp_dir), Some(file_config)).unwrap();
        assert_eq!(config.db_path, file_db);
        assert_eq!(config.maintenance_interval, Duration::from_secs(15 * 60));
        assert_eq!(config.retention.default_hours, 24);
        assert_eq!(config.retention.hours_for("reindex"), 72);
        assert_eq!(config.retention.hours_for("description_refresh"), 12);
        assert_eq!(config.retention.hours_for("git_pull"), 24);
    }

    #[test]
    fn test_missing_db_path_is_rejected() {
        let err = AppConfig::resolve(&CliConfig::default(), None).unwrap_err();
        assert!(err.to_string().contains("db_path must be specified"));
    }

    #[test]
    fn test_missing_db_directory_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_path: Some(temp_dir.path().join("nope").join("jobs.db")),
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli, None).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            maintenance_interval_minutes: 0,
            ..cli_with_db(&temp_dir)
        };
        assert!(AppConfig::resolve(&cli, None).is_err());

        let file_config = FileConfig {
            retention: Some(HashMap::from([("reindex".to_string(), 0)])),
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli_with_db(&temp_dir), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("reindex"));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("jobs.toml");
        std::fs::write(&path, "default_retention_hours = 48\n").unwrap();

        let file_config = FileConfig::load(&path).unwrap();
        assert_eq!(file_config.default_retention_hours, Some(48));
        assert!(FileConfig::load(&temp_dir.path().join("missing.toml")).is_err());
    }
}
