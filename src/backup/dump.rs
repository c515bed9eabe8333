//! Database dump with tiered fallback
//!
//! Tiers, in order: `pg_dump` inside the database container (when enabled),
//! `pg_dump` against the connection string, and finally a structured JSON
//! export read through the [`EntityStore`]. Only exhaustion of every tier is
//! an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tracing::{info, warn};

use crate::backup::entities;
use crate::backup::export::{EntityStore, StructuredExport};
use crate::backup::fallback::{Tier, first_success};
use crate::backup::process::{CommandSpec, ProcessRunner};
use crate::backup::{BackupError, JSON_EXPORT_FILE, Result, SQL_DUMP_FILE};
use crate::config::DatabaseConfig;

/// The database payload of a snapshot directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpArtifact {
    /// Output of a native dump tool, replayed with `psql`
    SqlDump(PathBuf),
    /// Tagged JSON document, replayed entity by entity
    StructuredExport(PathBuf),
}

impl DumpArtifact {
    /// Detect the artifact by file presence, preferring the SQL dump
    pub fn detect(snapshot_dir: &Path) -> Result<Self> {
        let sql = snapshot_dir.join(SQL_DUMP_FILE);
        if sql.is_file() {
            return Ok(Self::SqlDump(sql));
        }
        let json = snapshot_dir.join(JSON_EXPORT_FILE);
        if json.is_file() {
            return Ok(Self::StructuredExport(json));
        }
        Err(BackupError::InvalidArchive(format!(
            "{} contains neither {} nor {}",
            snapshot_dir.display(),
            SQL_DUMP_FILE,
            JSON_EXPORT_FILE
        )))
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::SqlDump(path) | Self::StructuredExport(path) => path,
        }
    }

    /// Short label for logs and reports
    pub fn format_name(&self) -> &'static str {
        match self {
            Self::SqlDump(_) => "sql",
            Self::StructuredExport(_) => "json",
        }
    }
}

/// `pg_dump` run inside the database container
pub fn dump_in_container(database: &DatabaseConfig, output: &Path) -> CommandSpec {
    CommandSpec::new("docker")
        .args(["exec", database.container.as_str(), "pg_dump"])
        .args(["-U", database.user.as_str(), "-d", database.name.as_str()])
        .args(["--clean", "--if-exists", "--no-owner"])
        .stdout_to(output)
}

/// `pg_dump` run locally against the connection string
pub fn dump_direct(database: &DatabaseConfig, output: &Path) -> CommandSpec {
    CommandSpec::new("pg_dump")
        .arg("--dbname")
        .arg(database.native_url())
        .args(["--clean", "--if-exists", "--no-owner"])
        .stdout_to(output)
}

/// `psql` run inside the database container, reading the dump from stdin
pub fn restore_in_container(database: &DatabaseConfig, dump: &Path) -> CommandSpec {
    CommandSpec::new("docker")
        .args(["exec", "-i", database.container.as_str(), "psql"])
        .args(["-U", database.user.as_str(), "-d", database.name.as_str()])
        .args(["-q", "-v", "ON_ERROR_STOP=1", "--single-transaction"])
        .stdin_from(dump)
        .discard_stdout()
}

/// `psql` run locally against the connection string
pub fn restore_direct(database: &DatabaseConfig, dump: &Path) -> CommandSpec {
    CommandSpec::new("psql")
        .arg("--dbname")
        .arg(database.native_url())
        .args(["-q", "-v", "ON_ERROR_STOP=1", "--single-transaction", "--file"])
        .arg(dump.to_string_lossy())
        .discard_stdout()
}

/// Produces the database dump of a snapshot
pub struct DumpStrategy {
    database: DatabaseConfig,
    runner: Arc<dyn ProcessRunner>,
    store: Arc<dyn EntityStore>,
}

impl DumpStrategy {
    pub fn new(
        database: DatabaseConfig,
        runner: Arc<dyn ProcessRunner>,
        store: Arc<dyn EntityStore>,
    ) -> Self {
        Self { database, runner, store }
    }

    /// Dump the database into `target_dir` using the best available tier
    pub async fn produce_dump(&self, target_dir: &Path) -> Result<DumpArtifact> {
        let sql_path = target_dir.join(SQL_DUMP_FILE);

        let mut tiers = Vec::with_capacity(3);
        if self.database.use_docker {
            tiers.push(Tier::new(
                "containerized pg_dump",
                self.native_dump(dump_in_container(&self.database, &sql_path)).boxed(),
            ));
        }
        tiers.push(Tier::new(
            "local pg_dump",
            self.native_dump(dump_direct(&self.database, &sql_path)).boxed(),
        ));
        tiers.push(Tier::new(
            "structured export",
            self.structured_export(target_dir).boxed(),
        ));

        match first_success(tiers).await {
            Ok((tier, artifact)) => {
                info!("Database dumped via {} to {}", tier, artifact.path().display());
                Ok(artifact)
            }
            Err(exhausted) => Err(BackupError::DumpUnavailable(exhausted.summary())),
        }
    }

    async fn native_dump(&self, command: CommandSpec) -> Result<DumpArtifact> {
        let output = command.stdout.clone().ok_or_else(|| {
            BackupError::Config(format!("{} has no output file", command.program))
        })?;

        let result = match self.runner.run(&command).await {
            Ok(_) if output.is_file() => Ok(DumpArtifact::SqlDump(output.clone())),
            Ok(_) => Err(BackupError::SubprocessFailure {
                program: command.program.clone(),
                message: String::from("finished without writing a dump"),
            }),
            Err(err) => Err(err),
        };

        if result.is_err() {
            // A partial dump must not survive into the snapshot
            if let Err(e) = tokio::fs::remove_file(&output).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial dump {}: {}", output.display(), e);
                }
            }
        }
        result
    }

    async fn structured_export(&self, target_dir: &Path) -> Result<DumpArtifact> {
        let snapshot = self.store.snapshot(entities::insert_order()).await?;
        let export = StructuredExport::from_snapshot(snapshot, Utc::now());

        let path = target_dir.join(JSON_EXPORT_FILE);
        tokio::fs::write(&path, serde_json::to_vec(&export)?).await?;

        Ok(DumpArtifact::StructuredExport(path))
    }
}
