//! Local backup directory: listing, lookup and retention of archives
//!
//! The directory is owned by the backup subsystem. It holds finished
//! `backup-<timestamp>.tar.gz` archives and, transiently, working and
//! extraction directories.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs as tokio_fs;
use tracing::{info, warn};

use crate::backup::naming::SnapshotName;
use crate::backup::{BackupError, Result};

/// A finished archive on disk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupArchive {
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// File birth time, falling back to modification time
    pub created_at: DateTime<Utc>,
}

/// Errors that send the backup directory to its fallback location
pub fn is_permission_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem
    )
}

/// The resolved backup directory
#[derive(Debug, Clone)]
pub struct ArchiveDirectory {
    path: PathBuf,
}

impl ArchiveDirectory {
    /// Use `path` as-is, creating it when missing
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        ensure_writable(&path).await?;
        Ok(Self { path })
    }

    /// Resolve the backup directory once, switching to `fallback` only when
    /// `primary` is not writable because of permissions or a read-only
    /// filesystem. Any other error is returned.
    pub async fn resolve(primary: &Path, fallback: &Path) -> Result<Self> {
        match Self::open(primary).await {
            Err(BackupError::Io(err)) if is_permission_error(&err) => {
                warn!(
                    "Backup directory {} is not writable ({}), using {}",
                    primary.display(),
                    err,
                    fallback.display()
                );
                Self::open(fallback).await.map_err(|fallback_err| {
                    BackupError::FilesystemPermission(format!(
                        "{}: {}; fallback {}: {}",
                        primary.display(),
                        err,
                        fallback.display(),
                        fallback_err
                    ))
                })
            }
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archive file names, newest first
    pub async fn archive_names(&self) -> Result<Vec<String>> {
        let mut entries = tokio_fs::read_dir(&self.path).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if SnapshotName::parse_archive_file_name(&name).is_some()
                && entry.file_type().await?.is_file()
            {
                names.push(name);
            }
        }

        // The naming scheme sorts chronologically
        names.sort_by(|a, b| b.cmp(a));
        Ok(names)
    }

    /// Metadata of every archive, newest first
    pub async fn list(&self) -> Result<Vec<BackupArchive>> {
        let mut archives = Vec::new();
        for filename in self.archive_names().await? {
            let path = self.path.join(&filename);
            archives.push(archive_metadata(&path, filename).await?);
        }
        Ok(archives)
    }

    /// Metadata of one archive
    pub async fn describe(&self, path: &Path) -> Result<BackupArchive> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| BackupError::ArchiveNotFound(path.display().to_string()))?;
        archive_metadata(path, filename).await
    }

    /// Resolve an archive reference: an absolute path is taken as-is, a
    /// bare file name is looked up in this directory.
    pub async fn locate(&self, reference: &str) -> Result<PathBuf> {
        let reference_path = Path::new(reference);
        let path = if reference_path.is_absolute() {
            reference_path.to_path_buf()
        } else {
            let mut components = reference_path.components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => self.path.join(reference_path),
                _ => return Err(BackupError::ArchiveNotFound(reference.to_string())),
            }
        };

        match tokio_fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(path),
            Ok(_) => Err(BackupError::ArchiveNotFound(reference.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BackupError::ArchiveNotFound(reference.to_string()))
            }
            Err(err) => Err(BackupError::Io(err)),
        }
    }

    /// Delete every archive beyond the `keep` most recent ones
    ///
    /// Deletion errors are returned, not swallowed.
    pub async fn enforce_retention(&self, keep: usize) -> Result<Vec<String>> {
        let names = self.archive_names().await?;
        let mut deleted = Vec::new();

        for name in names.into_iter().skip(keep) {
            tokio_fs::remove_file(self.path.join(&name)).await?;
            info!("Deleted old backup {}", name);
            deleted.push(name);
        }

        Ok(deleted)
    }
}

async fn archive_metadata(path: &Path, filename: String) -> Result<BackupArchive> {
    let metadata = tokio_fs::metadata(path).await?;
    let created = metadata.created().or_else(|_| metadata.modified())?;
    Ok(BackupArchive {
        filename,
        path: path.to_path_buf(),
        size_bytes: metadata.len(),
        created_at: DateTime::<Utc>::from(created),
    })
}

/// Create the directory if needed and prove it accepts new files
async fn ensure_writable(path: &Path) -> std::io::Result<()> {
    tokio_fs::create_dir_all(path).await?;
    let probe = path.join(".write-test");
    tokio_fs::write(&probe, b"").await?;
    tokio_fs::remove_file(&probe).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn archive_name(offset_minutes: i64) -> String {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        SnapshotName::at(base + Duration::minutes(offset_minutes)).archive_file_name()
    }

    async fn directory_with(names: &[String]) -> (tempfile::TempDir, ArchiveDirectory) {
        let temp_dir = tempdir().unwrap();
        for name in names {
            tokio_fs::write(temp_dir.path().join(name), name.as_bytes()).await.unwrap();
        }
        let directory = ArchiveDirectory::open(temp_dir.path()).await.unwrap();
        (temp_dir, directory)
    }

    #[tokio::test]
    async fn test_empty_directory_lists_nothing() {
        let (_temp_dir, directory) = directory_with(&[]).await;
        assert!(directory.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_ignores_foreign_files() {
        let names = vec![archive_name(0), archive_name(10)];
        let (temp_dir, directory) = directory_with(&names).await;
        tokio_fs::write(temp_dir.path().join("notes.txt"), b"x").await.unwrap();
        tokio_fs::write(temp_dir.path().join(format!("{}.tmp", archive_name(20))), b"x")
            .await
            .unwrap();
        tokio_fs::create_dir(temp_dir.path().join("backup-2025-06-01T00-30-00-000Z"))
            .await
            .unwrap();

        let archives = directory.list().await.unwrap();

        let listed: Vec<_> = archives.iter().map(|a| a.filename.clone()).collect();
        assert_eq!(listed, vec![archive_name(10), archive_name(0)]);
        assert_eq!(archives[0].size_bytes, archive_name(10).len() as u64);
    }

    #[tokio::test]
    async fn test_retention_keeps_most_recent() {
        let names: Vec<_> = (0..5).map(archive_name).collect();
        let (temp_dir, directory) = directory_with(&names).await;
        tokio_fs::write(temp_dir.path().join("notes.txt"), b"x").await.unwrap();

        let deleted = directory.enforce_retention(2).await.unwrap();

        assert_eq!(deleted, vec![archive_name(2), archive_name(1), archive_name(0)]);
        assert_eq!(
            directory.archive_names().await.unwrap(),
            vec![archive_name(4), archive_name(3)]
        );
        assert!(temp_dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_retention_with_fewer_archives_deletes_nothing() {
        let names = vec![archive_name(0)];
        let (_temp_dir, directory) = directory_with(&names).await;

        assert!(directory.enforce_retention(3).await.unwrap().is_empty());
        assert_eq!(directory.archive_names().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_locate() {
        let names = vec![archive_name(0)];
        let (temp_dir, directory) = directory_with(&names).await;
        let expected = temp_dir.path().join(&names[0]);

        assert_eq!(directory.locate(&names[0]).await.unwrap(), expected);
        assert_eq!(directory.locate(expected.to_str().unwrap()).await.unwrap(), expected);

        assert!(matches!(
            directory.locate("backup-1999-01-01T00-00-00-000Z.tar.gz").await,
            Err(BackupError::ArchiveNotFound(_))
        ));
        assert!(matches!(
            directory.locate("../elsewhere.tar.gz").await,
            Err(BackupError::ArchiveNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_uses_primary_when_writable() {
        let temp_dir = tempdir().unwrap();
        let primary = temp_dir.path().join("primary");
        let fallback = temp_dir.path().join("fallback");

        let directory = ArchiveDirectory::resolve(&primary, &fallback).await.unwrap();

        assert_eq!(directory.path(), primary);
        assert!(!fallback.exists());
    }

    #[tokio::test]
    async fn test_resolve_does_not_fall_back_on_other_errors() {
        let temp_dir = tempdir().unwrap();
        let blocker = temp_dir.path().join("file");
        tokio_fs::write(&blocker, b"x").await.unwrap();
        let fallback = temp_dir.path().join("fallback");

        // A regular file in the way is not a permission problem
        let err = ArchiveDirectory::resolve(&blocker.join("backups"), &fallback)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Io(_)));
        assert!(!fallback.exists());
    }

    #[test]
    fn test_permission_error_classification() {
        assert!(is_permission_error(&std::io::Error::from(ErrorKind::PermissionDenied)));
        assert!(is_permission_error(&std::io::Error::from(ErrorKind::ReadOnlyFilesystem)));
        assert!(!is_permission_error(&std::io::Error::from(ErrorKind::NotFound)));
        assert!(!is_permission_error(&std::io::Error::from(ErrorKind::StorageFull)));
    }
}
