//! Orchestration of backup runs, restores and listing
//!
//! At most one backup and at most one restore run at a time. A second
//! request while one is in flight is rejected rather than queued.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::backup::alert::{AlertSink, format_size, notify};
use crate::backup::archive;
use crate::backup::dump::DumpStrategy;
use crate::backup::export::EntityStore;
use crate::backup::naming::SnapshotName;
use crate::backup::process::ProcessRunner;
use crate::backup::restore::{RestoreEngine, RestoreReport};
use crate::backup::sidecar::{SidecarCollector, SidecarReport};
use crate::backup::storage::RemoteUploader;
use crate::backup::storage::local::{ArchiveDirectory, BackupArchive};
use crate::backup::{BackupError, Result};
use crate::config::BackupConfig;

/// Where the remote copy of an archive ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteUpload {
    Disabled,
    Uploaded { key: String },
    Failed { error: String },
}

/// Result of a backup run
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub archive: BackupArchive,
    /// `sql` or `json`
    pub format: &'static str,
    pub sidecars: SidecarReport,
    pub remote: RemoteUpload,
    /// Archives removed by retention
    pub pruned: Vec<String>,
    #[serde(skip)]
    pub duration: Duration,
}

/// Manager for backup and restore operations
pub struct BackupManager {
    /// Resolved backup directory
    directory: ArchiveDirectory,
    dumper: DumpStrategy,
    sidecars: SidecarCollector,
    restorer: RestoreEngine,
    /// Optional remote copy of each archive
    uploader: Option<Arc<dyn RemoteUploader>>,
    alerts: Arc<dyn AlertSink>,
    /// Number of most recent archives kept
    retention: usize,
    /// Held for the duration of a backup run
    backup_guard: Mutex<()>,
    /// Held for the duration of a restore
    restore_guard: Mutex<()>,
}

impl BackupManager {
    /// Create a new backup manager
    pub fn new(
        config: &BackupConfig,
        directory: ArchiveDirectory,
        runner: Arc<dyn ProcessRunner>,
        store: Arc<dyn EntityStore>,
        uploader: Option<Arc<dyn RemoteUploader>>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let sidecars = SidecarCollector::new(config.cert_path.clone(), config.env_file.clone());
        Self {
            dumper: DumpStrategy::new(config.database.clone(), runner.clone(), store.clone()),
            restorer: RestoreEngine::new(
                directory.clone(),
                config.database.clone(),
                runner,
                store,
                sidecars.clone(),
            ),
            directory,
            sidecars,
            uploader,
            alerts,
            retention: config.retention_days.max(1),
            backup_guard: Mutex::new(()),
            restore_guard: Mutex::new(()),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        self.directory.path()
    }

    /// Create a backup archive, upload it when configured and apply retention
    pub async fn create_backup(&self) -> Result<BackupReport> {
        let Ok(_guard) = self.backup_guard.try_lock() else {
            warn!("Backup requested while another backup is running");
            return Err(BackupError::AlreadyRunning("backup"));
        };

        let start_time = Instant::now();
        match self.run_backup(start_time).await {
            Ok(report) => {
                info!(
                    "Backup {} completed in {:?} ({} bytes)",
                    report.archive.filename, report.duration, report.archive.size_bytes
                );
                notify(self.alerts.as_ref(), &success_message(&report)).await;
                Ok(report)
            }
            Err(e) => {
                error!("Backup failed: {}", e);
                notify(self.alerts.as_ref(), &format!("Backup failed: {}", e)).await;
                Err(e)
            }
        }
    }

    async fn run_backup(&self, start_time: Instant) -> Result<BackupReport> {
        let (name, working) = self.working_dir()?;
        let archive_path = self.directory.path().join(name.archive_file_name());

        let snapshot = self.fill_snapshot(working.path(), &archive_path).await;

        let working_path = working.path().to_path_buf();
        if let Err(e) = working.close() {
            warn!("Failed to remove working directory {}: {}", working_path.display(), e);
        }
        let (format, sidecars) = snapshot?;

        let archive = self.directory.describe(&archive_path).await?;
        let remote = self.upload(&archive_path, &archive.filename).await;
        let pruned = self.directory.enforce_retention(self.retention).await?;

        Ok(BackupReport {
            archive,
            format,
            sidecars,
            remote,
            pruned,
            duration: start_time.elapsed(),
        })
    }

    /// Dump, collect sidecars and compress into `archive_path`
    async fn fill_snapshot(
        &self,
        working: &Path,
        archive_path: &Path,
    ) -> Result<(&'static str, SidecarReport)> {
        let artifact = self.dumper.produce_dump(working).await?;
        let sidecars = self.sidecars.collect(working).await?;
        archive::compress(working, archive_path).await?;
        Ok((artifact.format_name(), sidecars))
    }

    /// Create the working directory named after a fresh snapshot name,
    /// stepping forward a millisecond at a time past any collision
    fn working_dir(&self) -> Result<(SnapshotName, TempDir)> {
        let mut name = SnapshotName::now();
        loop {
            if self.directory.path().join(name.archive_file_name()).exists() {
                name = name.successor();
                continue;
            }
            match tempfile::Builder::new()
                .prefix(name.as_str())
                .rand_bytes(0)
                .tempdir_in(self.directory.path())
            {
                Ok(dir) => return Ok((name, dir)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => name = name.successor(),
                Err(e) => return Err(BackupError::Io(e)),
            }
        }
    }

    async fn upload(&self, archive_path: &Path, filename: &str) -> RemoteUpload {
        let Some(uploader) = &self.uploader else {
            return RemoteUpload::Disabled;
        };
        match uploader.upload(archive_path, filename).await {
            Ok(key) => RemoteUpload::Uploaded { key },
            Err(e) => {
                warn!("Remote upload of {} failed: {}", filename, e);
                RemoteUpload::Failed { error: e.to_string() }
            }
        }
    }

    /// Archives in the backup directory, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupArchive>> {
        self.directory.list().await
    }

    /// Restore from an archive given by file name or absolute path
    pub async fn restore_backup(&self, reference: &str) -> Result<RestoreReport> {
        let Ok(_guard) = self.restore_guard.try_lock() else {
            warn!("Restore requested while another restore is running");
            return Err(BackupError::AlreadyRunning("restore"));
        };

        let result = match self.directory.locate(reference).await {
            Ok(path) => self.restorer.restore(&path).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(report) => {
                info!("Restore from {} completed", report.archive);
                let mut message = format!("Restore completed from {}", report.archive);
                if !report.certificates_restored {
                    message.push_str(" (certificates not restored)");
                }
                notify(self.alerts.as_ref(), &message).await;
            }
            Err(e) => {
                error!("Restore from {} failed: {}", reference, e);
                notify(self.alerts.as_ref(), &format!("Restore from {} failed: {}", reference, e))
                    .await;
            }
        }
        result
    }
}

fn success_message(report: &BackupReport) -> String {
    let mut message = format!(
        "Backup completed: {} ({}, {} dump) at {}",
        report.archive.filename,
        format_size(report.archive.size_bytes),
        report.format,
        report.archive.created_at.to_rfc3339()
    );
    match &report.remote {
        RemoteUpload::Disabled => {}
        RemoteUpload::Uploaded { key } => message.push_str(&format!("; uploaded to {}", key)),
        RemoteUpload::Failed { error } => {
            message.push_str(&format!("; remote upload failed: {}", error))
        }
    }
    message
}
