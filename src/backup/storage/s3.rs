//! AWS S3 implementation of the RemoteUploader trait
//!
//! Works against AWS itself or any S3-compatible store reachable through a
//! custom endpoint.

use std::path::Path;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::SdkError;
use tokio::fs as tokio_fs;
use tracing::{debug, error, info};

use super::RemoteUploader;
use crate::backup::{BackupError, Result};
use crate::config::RemoteConfig;

/// Uploads archives to an S3 bucket
pub struct S3Uploader {
    /// S3 client
    client: S3Client,
    /// S3 bucket name
    bucket: String,
    /// Prefix for archive objects
    prefix: String,
}

/// Object key for an archive
fn object_key(prefix: &str, filename: &str) -> String {
    format!("{}{}", prefix, filename)
}

impl S3Uploader {
    /// Create a new S3Uploader with the given configuration
    pub async fn new(config: &RemoteConfig) -> Self {
        let mut loader =
            aws_config::from_env().region(aws_types::region::Region::new(config.region.clone()));

        // Static keys win over the default credential provider chain
        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "panel-backup-config",
            ));
        }
        let aws_config = loader.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint) = &config.endpoint {
            // S3-compatible stores generally only support path-style addressing
            s3_config = s3_config.endpoint_url(endpoint.clone()).force_path_style(true);
        }

        Self {
            client: S3Client::from_conf(s3_config.build()),
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
        }
    }

    /// Map AWS S3 errors to BackupError
    fn map_s3_error<E: std::fmt::Debug>(&self, error: SdkError<E>, operation: &str) -> BackupError {
        let kind = match &error {
            SdkError::ConstructionFailure(_) => "client construction error",
            SdkError::DispatchFailure(_) => "dispatch error",
            SdkError::ResponseError(_) => "response error",
            SdkError::TimeoutError(_) => "timeout",
            SdkError::ServiceError(_) => "service error",
            _ => "unknown error",
        };
        BackupError::Storage(format!("S3 {} during {}: {:?}", kind, operation, error))
    }
}

#[async_trait]
impl RemoteUploader for S3Uploader {
    async fn upload(&self, archive_path: &Path, filename: &str) -> Result<String> {
        let body = tokio_fs::read(archive_path).await?;
        let key = object_key(&self.prefix, filename);

        debug!("Uploading {} to S3 bucket {} with key {}", filename, self.bucket, key);
        match self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body.into())
            .send()
            .await
        {
            Ok(_) => {
                info!("Uploaded backup {} to s3://{}/{}", filename, self.bucket, key);
                Ok(key)
            }
            Err(err) => {
                error!("Failed to upload backup to S3: {}", err);
                Err(self.map_s3_error(err, "upload"))
            }
        }
    }
}
