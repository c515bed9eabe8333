//! Storage for finished archives
//!
//! Archives always live in the local backup directory. Uploading a copy to
//! object storage is optional and sits behind the [`RemoteUploader`] trait.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::backup::Result;
use crate::config::BackupConfig;

pub mod local;
pub mod s3;

/// Pushes a finished archive to remote object storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteUploader: Send + Sync {
    /// Upload the archive at `archive_path`, returning the remote object key
    async fn upload(&self, archive_path: &Path, filename: &str) -> Result<String>;
}

/// Create the remote uploader if remote upload is configured
pub async fn create_remote_uploader(config: &BackupConfig) -> Option<Arc<dyn RemoteUploader>> {
    let remote = config.remote.as_ref()?;
    Some(Arc::new(s3::S3Uploader::new(remote).await))
}
