//! Restoring the database and certificates from an archive
//!
//! The archive is extracted into a scratch directory inside the backup
//! directory. The dump format is detected by file presence: a SQL dump is
//! replayed with `psql`, a structured export is replayed entity by entity in
//! a single transaction. The scratch directory is removed on every exit path.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backup::archive;
use crate::backup::dump::{self, DumpArtifact};
use crate::backup::export::{EntityStore, ReplayPlan, StructuredExport};
use crate::backup::fallback::{Tier, first_success};
use crate::backup::naming::timestamp_token;
use crate::backup::process::{CommandSpec, ProcessRunner};
use crate::backup::sidecar::SidecarCollector;
use crate::backup::storage::local::ArchiveDirectory;
use crate::backup::{BackupError, Result};
use crate::config::DatabaseConfig;

/// Outcome of a successful restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub archive: String,
    /// `sql` or `json`
    pub format: &'static str,
    /// Tool or path that replayed the dump
    pub method: &'static str,
    /// Rows inserted by a structured replay, `None` for SQL dumps
    pub rows_restored: Option<usize>,
    pub certificates_restored: bool,
}

/// Replays archives into the live database
pub struct RestoreEngine {
    directory: ArchiveDirectory,
    database: DatabaseConfig,
    runner: Arc<dyn ProcessRunner>,
    store: Arc<dyn EntityStore>,
    sidecars: SidecarCollector,
}

impl RestoreEngine {
    pub fn new(
        directory: ArchiveDirectory,
        database: DatabaseConfig,
        runner: Arc<dyn ProcessRunner>,
        store: Arc<dyn EntityStore>,
        sidecars: SidecarCollector,
    ) -> Self {
        Self { directory, database, runner, store, sidecars }
    }

    /// Restore from an archive file
    pub async fn restore(&self, archive_path: &Path) -> Result<RestoreReport> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("restore-temp-{}-", timestamp_token(Utc::now())))
            .tempdir_in(self.directory.path())?;

        let outcome = self.restore_from(archive_path, scratch.path()).await;

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!("Failed to remove {}: {}", scratch_path.display(), e);
        }
        outcome
    }

    async fn restore_from(&self, archive_path: &Path, scratch: &Path) -> Result<RestoreReport> {
        let snapshot_dir = archive::extract(archive_path, scratch).await?;
        let artifact = DumpArtifact::detect(&snapshot_dir)?;
        info!(
            "Restoring {} ({} dump)",
            archive_path.display(),
            artifact.format_name()
        );

        let (method, rows_restored) = match &artifact {
            DumpArtifact::SqlDump(path) => (self.replay_sql(path).await?, None),
            DumpArtifact::StructuredExport(path) => {
                let rows = self.replay_structured(path).await?;
                ("structured replay", Some(rows))
            }
        };

        // The database is already restored at this point
        let certificates_restored = match self.sidecars.restore_certificates(&snapshot_dir).await {
            Ok(restored) => restored,
            Err(e) => {
                warn!("Database restored but certificates were not: {}", e);
                false
            }
        };

        Ok(RestoreReport {
            archive: archive_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            format: artifact.format_name(),
            method,
            rows_restored,
            certificates_restored,
        })
    }

    async fn replay_sql(&self, dump_path: &Path) -> Result<&'static str> {
        let mut tiers = Vec::with_capacity(2);
        if self.database.use_docker {
            tiers.push(Tier::new(
                "containerized psql",
                self.run_tool(dump::restore_in_container(&self.database, dump_path)).boxed(),
            ));
        }
        tiers.push(Tier::new(
            "local psql",
            self.run_tool(dump::restore_direct(&self.database, dump_path)).boxed(),
        ));

        match first_success(tiers).await {
            Ok((tier, ())) => {
                info!("SQL dump replayed via {}", tier);
                Ok(tier)
            }
            Err(exhausted) => Err(BackupError::SubprocessFailure {
                program: String::from("psql"),
                message: exhausted.summary(),
            }),
        }
    }

    async fn run_tool(&self, command: CommandSpec) -> Result<()> {
        let output = self.runner.run(&command).await?;
        debug!("{} wrote {} bytes of output", command.program, output.stdout.len());
        if !output.stderr.is_empty() {
            debug!("{} reported: {}", command.program, output.stderr);
        }
        Ok(())
    }

    /// Replay a structured export, returning the number of rows inserted
    async fn replay_structured(&self, export_path: &Path) -> Result<usize> {
        let bytes = tokio::fs::read(export_path).await?;
        let export = StructuredExport::from_slice(&bytes)?;
        for key in export.unknown_keys() {
            warn!("Ignoring unknown entity '{}' in export", key);
        }

        let plan = ReplayPlan::for_export(&export, self.store.as_ref()).await?;
        let rows = plan.inserts.iter().map(|(_, rows)| rows.len()).sum();

        self.store.replace_all(&plan).await?;
        info!("Structured export replayed: {} rows", rows);
        Ok(rows)
    }
}
