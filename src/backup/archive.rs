//! Packing snapshot directories into `.tar.gz` archives and back

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder};

use crate::backup::{BackupError, Result};

fn join_error(e: tokio::task::JoinError) -> BackupError {
    BackupError::Io(io::Error::other(e))
}

/// Compress `snapshot_dir` into `archive_path`
///
/// The archive holds a single top-level directory named after the snapshot.
/// It is written under a temporary name and renamed into place, so a file
/// at `archive_path` is always complete.
pub async fn compress(snapshot_dir: &Path, archive_path: &Path) -> Result<()> {
    let snapshot_dir = snapshot_dir.to_path_buf();
    let archive_path = archive_path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let root = snapshot_dir
            .file_name()
            .ok_or_else(|| {
                BackupError::InvalidArchive(format!("{} has no name", snapshot_dir.display()))
            })?
            .to_owned();
        let partial = archive_path.with_extension("gz.tmp");

        let written = (|| -> io::Result<()> {
            let encoder = GzEncoder::new(File::create(&partial)?, Compression::default());
            let mut tar = Builder::new(encoder);
            tar.append_dir_all(&root, &snapshot_dir)?;
            tar.into_inner()?.finish()?.sync_all()?;
            std::fs::rename(&partial, &archive_path)
        })();

        if let Err(err) = written {
            let _ = std::fs::remove_file(&partial);
            return Err(BackupError::Io(err));
        }
        Ok(())
    })
    .await
    .map_err(join_error)?
}

/// Extract `archive_path` into `into`, returning the snapshot directory
///
/// The archive must contain exactly one top-level directory.
pub async fn extract(archive_path: &Path, into: &Path) -> Result<PathBuf> {
    let archive_path = archive_path.to_path_buf();
    let into = into.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        let file = File::open(&archive_path)?;
        Archive::new(GzDecoder::new(file))
            .unpack(&into)
            .map_err(|e| {
                BackupError::InvalidArchive(format!("{}: {}", archive_path.display(), e))
            })?;

        let mut directories = Vec::new();
        for entry in std::fs::read_dir(&into)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                directories.push(entry.path());
            }
        }

        match directories.len() {
            1 => Ok(directories.remove(0)),
            0 => Err(BackupError::InvalidArchive(format!(
                "{} has no snapshot directory",
                archive_path.display()
            ))),
            n => Err(BackupError::InvalidArchive(format!(
                "{} has {} top-level directories, expected one",
                archive_path.display(),
                n
            ))),
        }
    })
    .await
    .map_err(join_error)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_compress_then_extract() {
        let temp_dir = tempdir().unwrap();
        let snapshot = temp_dir.path().join("backup-2025-06-01T14-30-00-123Z");
        fs::create_dir_all(snapshot.join("certs")).unwrap();
        fs::write(snapshot.join("database.sql"), "-- dump").unwrap();
        fs::write(snapshot.join("certs/cert.pem"), "cert").unwrap();
        let archive = temp_dir.path().join("backup-2025-06-01T14-30-00-123Z.tar.gz");

        compress(&snapshot, &archive).await.unwrap();
        assert!(archive.is_file());
        assert!(!temp_dir.path().join("backup-2025-06-01T14-30-00-123Z.tar.gz.tmp").exists());

        let target = temp_dir.path().join("extracted");
        fs::create_dir(&target).unwrap();
        let extracted = extract(&archive, &target).await.unwrap();

        assert_eq!(extracted, target.join("backup-2025-06-01T14-30-00-123Z"));
        assert_eq!(fs::read_to_string(extracted.join("database.sql")).unwrap(), "-- dump");
        assert_eq!(fs::read_to_string(extracted.join("certs/cert.pem")).unwrap(), "cert");
    }

    #[tokio::test]
    async fn test_extract_rejects_archive_without_directory() {
        let temp_dir = tempdir().unwrap();
        let archive = temp_dir.path().join("flat.tar.gz");
        {
            let encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
            let mut tar = Builder::new(encoder);
            let data = b"-- dump";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, "database.sql", &data[..]).unwrap();
            tar.into_inner().unwrap().finish().unwrap();
        }

        let target = temp_dir.path().join("extracted");
        fs::create_dir(&target).unwrap();
        let err = extract(&archive, &target).await.unwrap_err();

        assert!(matches!(err, BackupError::InvalidArchive(_)));
    }

    #[tokio::test]
    async fn test_extract_rejects_garbage() {
        let temp_dir = tempdir().unwrap();
        let archive = temp_dir.path().join("garbage.tar.gz");
        fs::write(&archive, b"definitely not gzip").unwrap();

        let err = extract(&archive, temp_dir.path()).await.unwrap_err();

        assert!(matches!(err, BackupError::InvalidArchive(_)));
    }
}
