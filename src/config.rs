use std::env;
use std::path::PathBuf;

use crate::backup::{BackupError, Result};

/// Connection details for the panel database and its native tools
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Connection string used by the application
    pub url: String,
    /// Whether dump/restore should first be attempted inside the database container
    pub use_docker: bool,
    /// Name of the database container
    pub container: String,
    /// Database role used inside the container
    pub user: String,
    /// Database name used inside the container
    pub name: String,
}

impl DatabaseConfig {
    /// Connection string accepted by `pg_dump`/`psql`
    ///
    /// Prisma-style URLs carry a `schema` query parameter the native tools
    /// reject; it is removed and every other parameter is kept.
    pub fn native_url(&self) -> String {
        let Some((base, query)) = self.url.split_once('?') else {
            return self.url.clone();
        };
        let kept: Vec<&str> = query
            .split('&')
            .filter(|param| !param.is_empty() && !param.starts_with("schema="))
            .collect();
        if kept.is_empty() {
            base.to_string()
        } else {
            format!("{}?{}", base, kept.join("&"))
        }
    }
}

/// Extract the database name from a connection string
fn database_name_from_url(url: &str) -> Option<String> {
    let without_query = url.split('?').next()?;
    let (_, name) = without_query.rsplit_once('/')?;
    (!name.is_empty() && !name.contains('@')).then(|| name.to_string())
}

/// Optional upload of finished archives to S3-compatible object storage
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConfig {
    /// S3 bucket name for archives
    pub bucket: String,
    /// AWS region for S3 operations
    pub region: String,
    /// Custom endpoint for S3-compatible stores
    pub endpoint: Option<String>,
    /// Static access key; the default credential chain is used when absent
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Prefix for archive object keys
    pub prefix: String,
}

/// Configuration for backup, restore and scheduling
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Directory archives are written to
    pub backup_dir: PathBuf,
    /// Directory used when `backup_dir` is not writable
    pub fallback_backup_dir: PathBuf,
    /// Number of most recent archives to keep
    pub retention_days: usize,
    /// Cron expression for scheduled backups, `None` to disable
    pub schedule: Option<String>,
    pub database: DatabaseConfig,
    /// Certificate directory or single certificate file
    pub cert_path: Option<PathBuf>,
    /// Active configuration file
    pub env_file: Option<PathBuf>,
    /// Remote upload, `None` when disabled
    pub remote: Option<RemoteConfig>,
    /// Cap on captured subprocess output
    pub max_output_bytes: usize,
    /// Address the manual-trigger API listens on
    pub listen_addr: String,
}

const DEFAULT_RETENTION_DAYS: usize = 7;
const DEFAULT_SCHEDULE: &str = "0 3 * * *";
const DEFAULT_MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

fn flag(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl BackupConfig {
    /// Load backup configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load backup configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let url = get("DATABASE_URL")
            .ok_or_else(|| BackupError::Config(String::from("DATABASE_URL is not set")))?;

        let name = match get("BACKUP_DB_NAME").or_else(|| database_name_from_url(&url)) {
            Some(name) => name,
            None => {
                return Err(BackupError::Config(format!(
                    "cannot determine database name from {}; set BACKUP_DB_NAME",
                    url
                )));
            }
        };

        let database = DatabaseConfig {
            use_docker: flag(get("BACKUP_USE_DOCKER"), false),
            container: get("BACKUP_DB_CONTAINER").unwrap_or_else(|| String::from("db")),
            user: get("BACKUP_DB_USER").unwrap_or_else(|| String::from("postgres")),
            name,
            url,
        };

        let remote = if flag(get("BACKUP_S3_ENABLED"), false) {
            let bucket = get("BACKUP_S3_BUCKET").ok_or_else(|| {
                BackupError::Config(String::from(
                    "BACKUP_S3_ENABLED is set but BACKUP_S3_BUCKET is empty",
                ))
            })?;
            Some(RemoteConfig {
                bucket,
                region: get("AWS_REGION").unwrap_or_else(|| String::from("us-east-1")),
                endpoint: get("BACKUP_S3_ENDPOINT"),
                access_key_id: get("BACKUP_S3_ACCESS_KEY_ID"),
                secret_access_key: get("BACKUP_S3_SECRET_ACCESS_KEY"),
                prefix: get("BACKUP_S3_PREFIX").unwrap_or_else(|| String::from("backups/")),
            })
        } else {
            None
        };

        let retention_days = get("BACKUP_RETENTION_DAYS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_RETENTION_DAYS)
            .max(1);

        let schedule = if flag(get("BACKUP_SCHEDULE_ENABLED"), true) {
            Some(get("BACKUP_CRON").unwrap_or_else(|| String::from(DEFAULT_SCHEDULE)))
        } else {
            None
        };

        Ok(Self {
            backup_dir: get("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./backups")),
            fallback_backup_dir: get("BACKUP_FALLBACK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| env::temp_dir().join("panel-backups")),
            retention_days,
            schedule,
            database,
            cert_path: get("SSL_CERT_PATH").map(PathBuf::from),
            env_file: Some(
                get("BACKUP_ENV_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(".env")),
            ),
            remote,
            max_output_bytes: get("BACKUP_MAX_OUTPUT_BYTES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_MAX_OUTPUT_BYTES),
            listen_addr: get("BACKUP_LISTEN_ADDR").unwrap_or_else(|| String::from("0.0.0.0:8080")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<BackupConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BackupConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[(
            "DATABASE_URL",
            "postgresql://postgres:pw@db:5432/panel?schema=public",
        )])
        .unwrap();

        assert_eq!(config.backup_dir, PathBuf::from("./backups"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.schedule.as_deref(), Some("0 3 * * *"));
        assert_eq!(config.database.name, "panel");
        assert_eq!(config.database.container, "db");
        assert!(!config.database.use_docker);
        assert!(config.remote.is_none());
        assert_eq!(config.env_file, Some(PathBuf::from(".env")));
    }

    #[test]
    fn test_database_url_required() {
        assert!(matches!(load(&[]), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_retention_is_at_least_one() {
        let config = load(&[
            ("DATABASE_URL", "postgresql://localhost/panel"),
            ("BACKUP_RETENTION_DAYS", "0"),
        ])
        .unwrap();
        assert_eq!(config.retention_days, 1);
    }

    #[test]
    fn test_schedule_can_be_disabled() {
        let config = load(&[
            ("DATABASE_URL", "postgresql://localhost/panel"),
            ("BACKUP_SCHEDULE_ENABLED", "false"),
        ])
        .unwrap();
        assert!(config.schedule.is_none());
    }

    #[test]
    fn test_remote_requires_bucket() {
        let err = load(&[
            ("DATABASE_URL", "postgresql://localhost/panel"),
            ("BACKUP_S3_ENABLED", "true"),
        ])
        .unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));

        let config = load(&[
            ("DATABASE_URL", "postgresql://localhost/panel"),
            ("BACKUP_S3_ENABLED", "true"),
            ("BACKUP_S3_BUCKET", "panel-backups"),
            ("BACKUP_S3_ENDPOINT", "https://minio.internal:9000"),
        ])
        .unwrap();
        let remote = config.remote.unwrap();
        assert_eq!(remote.bucket, "panel-backups");
        assert_eq!(remote.prefix, "backups/");
        assert_eq!(remote.endpoint.as_deref(), Some("https://minio.internal:9000"));
    }

    #[test]
    fn test_native_url_strips_schema_param() {
        let mut database = load(&[("DATABASE_URL", "postgresql://u:p@db:5432/panel?schema=public")])
            .unwrap()
            .database;
        assert_eq!(database.native_url(), "postgresql://u:p@db:5432/panel");

        database.url = String::from("postgresql://u:p@db:5432/panel?sslmode=require&schema=public");
        assert_eq!(database.native_url(), "postgresql://u:p@db:5432/panel?sslmode=require");

        database.url = String::from("postgresql://u:p@db:5432/panel");
        assert_eq!(database.native_url(), "postgresql://u:p@db:5432/panel");
    }

    #[test]
    fn test_database_name_from_url() {
        assert_eq!(
            database_name_from_url("postgresql://u:p@db:5432/panel?schema=x"),
            Some(String::from("panel"))
        );
        assert_eq!(database_name_from_url("postgresql://u:p@db:5432/"), None);
    }
}
