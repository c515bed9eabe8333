//! TLS material and config file copied alongside the database dump
//!
//! Both sidecars are optional: a backup without certificates or without a
//! config file is still a valid backup.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::backup::{BackupError, CERTS_DIR, ENV_FILE, Result};

/// What a sidecar collection copied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SidecarReport {
    pub certificates: bool,
    pub env_file: bool,
}

/// Copies certificate material and the config file into snapshots
#[derive(Debug, Clone)]
pub struct SidecarCollector {
    cert_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
}

impl SidecarCollector {
    pub fn new(cert_path: Option<PathBuf>, env_file: Option<PathBuf>) -> Self {
        Self { cert_path, env_file }
    }

    /// Copy the sidecars into `target_dir`, warning about missing sources
    pub async fn collect(&self, target_dir: &Path) -> Result<SidecarReport> {
        let cert_path = self.cert_path.clone();
        let env_file = self.env_file.clone();
        let target_dir = target_dir.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<SidecarReport> {
            let mut report = SidecarReport::default();

            match cert_path {
                Some(source) if source.exists() => {
                    let certs_dir = target_dir.join(CERTS_DIR);
                    if source.is_dir() {
                        copy_dir_recursive(&source, &certs_dir)?;
                    } else {
                        fs::create_dir_all(&certs_dir)?;
                        copy_into(&source, &certs_dir)?;
                    }
                    report.certificates = true;
                }
                Some(source) => {
                    warn!("Certificate path {} does not exist, skipping", source.display())
                }
                None => warn!("No certificate path configured, skipping certificates"),
            }

            match env_file {
                Some(source) if source.is_file() => {
                    fs::copy(&source, target_dir.join(ENV_FILE))?;
                    report.env_file = true;
                }
                Some(source) => warn!("Config file {} does not exist, skipping", source.display()),
                None => {}
            }

            Ok(report)
        })
        .await
        .map_err(|e| BackupError::Io(io::Error::other(e)))?
    }

    /// Copy `certs/` from a snapshot back to the configured certificate
    /// location. Returns whether anything was restored.
    pub async fn restore_certificates(&self, snapshot_dir: &Path) -> Result<bool> {
        let source = snapshot_dir.join(CERTS_DIR);
        if !source.is_dir() {
            warn!("Snapshot has no {} directory, certificates not restored", CERTS_DIR);
            return Ok(false);
        }
        let Some(cert_path) = self.cert_path.clone() else {
            warn!("No certificate path configured, certificates not restored");
            return Ok(false);
        };

        let restored = tokio::task::spawn_blocking(move || -> io::Result<PathBuf> {
            let target = certificate_target_dir(&cert_path);
            copy_dir_recursive(&source, &target)?;
            Ok(target)
        })
        .await
        .map_err(|e| BackupError::Io(io::Error::other(e)))??;

        info!("Certificates restored to {}", restored.display());
        Ok(true)
    }
}

/// Directory certificates are restored into
///
/// A directory-shaped certificate path receives the files directly. A
/// single-file certificate path receives them in its parent directory, which
/// recreates the file under its original name next to any key files.
fn certificate_target_dir(cert_path: &Path) -> PathBuf {
    let is_dir_shaped =
        cert_path.is_dir() || (!cert_path.exists() && cert_path.extension().is_none());
    if is_dir_shaped {
        return cert_path.to_path_buf();
    }
    match cert_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn copy_into(file: &Path, dir: &Path) -> io::Result<()> {
    let name = file
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    fs::copy(file, dir.join(name))?;
    Ok(())
}

/// Copy a directory tree, following symlinks to their targets
pub fn copy_dir_recursive(source: &Path, target: &Path) -> io::Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        let destination = target.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &destination)?;
        } else {
            fs::copy(&path, &destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_collects_certificate_directory_and_env() {
        let temp_dir = tempdir().unwrap();
        let certs = temp_dir.path().join("certs-live");
        fs::create_dir_all(certs.join("archive")).unwrap();
        fs::write(certs.join("fullchain.pem"), "chain").unwrap();
        fs::write(certs.join("archive").join("key.pem"), "key").unwrap();
        let env_file = temp_dir.path().join("panel.env");
        fs::write(&env_file, "DATABASE_URL=x").unwrap();
        let snapshot = temp_dir.path().join("snapshot");
        fs::create_dir(&snapshot).unwrap();

        let collector = SidecarCollector::new(Some(certs), Some(env_file));
        let report = collector.collect(&snapshot).await.unwrap();

        assert_eq!(report, SidecarReport { certificates: true, env_file: true });
        assert_eq!(fs::read_to_string(snapshot.join("certs/fullchain.pem")).unwrap(), "chain");
        assert_eq!(fs::read_to_string(snapshot.join("certs/archive/key.pem")).unwrap(), "key");
        assert_eq!(fs::read_to_string(snapshot.join(".env")).unwrap(), "DATABASE_URL=x");
    }

    #[tokio::test]
    async fn test_collects_single_certificate_file() {
        let temp_dir = tempdir().unwrap();
        let cert = temp_dir.path().join("cert.pem");
        fs::write(&cert, "cert").unwrap();
        let snapshot = temp_dir.path().join("snapshot");
        fs::create_dir(&snapshot).unwrap();

        let report = SidecarCollector::new(Some(cert), None).collect(&snapshot).await.unwrap();

        assert!(report.certificates);
        assert!(!report.env_file);
        assert_eq!(fs::read_to_string(snapshot.join("certs/cert.pem")).unwrap(), "cert");
    }

    #[tokio::test]
    async fn test_missing_sources_are_not_errors() {
        let temp_dir = tempdir().unwrap();
        let collector = SidecarCollector::new(
            Some(temp_dir.path().join("no-certs")),
            Some(temp_dir.path().join("no.env")),
        );

        let report = collector.collect(temp_dir.path()).await.unwrap();

        assert_eq!(report, SidecarReport::default());
        assert!(!temp_dir.path().join(CERTS_DIR).exists());
    }

    #[tokio::test]
    async fn test_restore_into_certificate_directory() {
        let temp_dir = tempdir().unwrap();
        let snapshot = temp_dir.path().join("snapshot");
        fs::create_dir_all(snapshot.join(CERTS_DIR)).unwrap();
        fs::write(snapshot.join("certs/key.pem"), "key").unwrap();
        let live = temp_dir.path().join("live-certs");
        fs::create_dir(&live).unwrap();

        let restored = SidecarCollector::new(Some(live.clone()), None)
            .restore_certificates(&snapshot)
            .await
            .unwrap();

        assert!(restored);
        assert_eq!(fs::read_to_string(live.join("key.pem")).unwrap(), "key");
    }

    #[tokio::test]
    async fn test_restore_next_to_single_certificate_file() {
        let temp_dir = tempdir().unwrap();
        let snapshot = temp_dir.path().join("snapshot");
        fs::create_dir_all(snapshot.join(CERTS_DIR)).unwrap();
        fs::write(snapshot.join("certs/cert.pem"), "restored").unwrap();
        let live_dir = temp_dir.path().join("ssl");
        fs::create_dir(&live_dir).unwrap();
        let cert = live_dir.join("cert.pem");
        fs::write(&cert, "stale").unwrap();

        SidecarCollector::new(Some(cert.clone()), None)
            .restore_certificates(&snapshot)
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(&cert).unwrap(), "restored");
    }

    #[tokio::test]
    async fn test_restore_without_certs_is_a_warning() {
        let temp_dir = tempdir().unwrap();
        let restored = SidecarCollector::new(Some(temp_dir.path().join("ssl")), None)
            .restore_certificates(temp_dir.path())
            .await
            .unwrap();

        assert!(!restored);
        assert!(!temp_dir.path().join("ssl").exists());
    }
}
