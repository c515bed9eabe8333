//! Cron-driven backup runs

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::backup::manager::BackupManager;
use crate::backup::{BackupError, Result};

/// Accept standard 5-field expressions alongside the 6/7-field form the
/// `cron` crate expects, by adding a zero seconds field
pub fn normalize_cron(expression: &str) -> String {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

/// What a scheduled firing did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledRun {
    Completed(String),
    /// Another backup was already running
    Skipped,
    Failed(String),
}

/// Fires backups on a cron schedule (UTC)
#[derive(Debug, Clone)]
pub struct BackupScheduler {
    expression: String,
    schedule: Schedule,
}

impl BackupScheduler {
    /// Validate a cron expression
    pub fn new(expression: &str) -> Result<Self> {
        let schedule = Schedule::from_str(&normalize_cron(expression)).map_err(|e| {
            BackupError::InvalidSchedule {
                expression: expression.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// First firing strictly after `after`
    pub fn next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Spawn the scheduling loop
    pub fn start(self, manager: Arc<BackupManager>) -> JoinHandle<()> {
        info!("Scheduled backups enabled: '{}' (UTC)", self.expression);
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = self.next_run(now) else {
                    warn!("Schedule '{}' has no upcoming runs, stopping", self.expression);
                    return;
                };
                debug!("Next scheduled backup at {}", next);

                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;

                run_scheduled(&manager).await;
            }
        })
    }
}

/// Run one scheduled backup. Failures are logged here; the manager has
/// already sent the failure alert.
pub async fn run_scheduled(manager: &BackupManager) -> ScheduledRun {
    match manager.create_backup().await {
        Ok(report) => {
            info!("Scheduled backup created: {}", report.archive.filename);
            ScheduledRun::Completed(report.archive.filename)
        }
        Err(BackupError::AlreadyRunning(_)) => {
            info!("Skipping scheduled backup, a backup is already running");
            ScheduledRun::Skipped
        }
        Err(e) => {
            warn!("Scheduled backup failed: {}", e);
            ScheduledRun::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::alert::MockAlertSink;
    use crate::backup::process::MockProcessRunner;
    use crate::backup::storage::local::ArchiveDirectory;
    use crate::backup::testing::MemoryStore;
    use crate::config::BackupConfig;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("0 3 * * *"), "0 0 3 * * *");
        assert_eq!(normalize_cron(" 30 0 3 * * * "), "30 0 3 * * *");
    }

    #[test]
    fn test_next_run_daily() {
        let scheduler = BackupScheduler::new("0 3 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 4, 0, 0).unwrap();

        assert_eq!(
            scheduler.next_run(after),
            Some(Utc.with_ymd_and_hms(2025, 6, 2, 3, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_expression() {
        let err = BackupScheduler::new("every night").unwrap_err();
        assert!(matches!(
            err,
            BackupError::InvalidSchedule { expression, .. } if expression == "every night"
        ));
    }

    async fn manager(store: MemoryStore, dir: &std::path::Path) -> BackupManager {
        let mut config = BackupConfig::from_lookup(|key| match key {
            "DATABASE_URL" => Some(String::from("postgresql://localhost/panel")),
            _ => None,
        })
        .unwrap();
        config.env_file = None;

        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(|spec| {
            Err(BackupError::SubprocessFailure {
                program: spec.program.clone(),
                message: String::from("command not found"),
            })
        });
        let mut alerts = MockAlertSink::new();
        alerts.expect_send_alert().returning(|_| Ok(()));

        BackupManager::new(
            &config,
            ArchiveDirectory::open(dir).await.unwrap(),
            Arc::new(runner),
            Arc::new(store),
            None,
            Arc::new(alerts),
        )
    }

    #[tokio::test]
    async fn test_run_scheduled_reports_outcome() {
        let temp_dir = tempdir().unwrap();
        let store = MemoryStore::new().with_rows("users", vec![json!({ "id": 1 })]);
        let manager = manager(store, temp_dir.path()).await;

        match run_scheduled(&manager).await {
            ScheduledRun::Completed(filename) => assert!(filename.starts_with("backup-")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_scheduled_failure_is_contained() {
        let temp_dir = tempdir().unwrap();
        let manager = manager(MemoryStore::new().failing_snapshot(), temp_dir.path()).await;

        assert!(matches!(run_scheduled(&manager).await, ScheduledRun::Failed(_)));
    }
}
