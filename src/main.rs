use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dotenv::dotenv;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod backup;
mod config;
mod db;

use backup::BackupError;
use backup::alert::LogAlertSink;
use backup::manager::{BackupManager, BackupReport};
use backup::process::TokioProcessRunner;
use backup::restore::RestoreReport;
use backup::scheduler::BackupScheduler;
use backup::storage::create_remote_uploader;
use backup::storage::local::{ArchiveDirectory, BackupArchive};
use config::BackupConfig;

// Shared state for the manual-trigger API
struct AppState {
    manager: Arc<BackupManager>,
}

impl IntoResponse for BackupError {
    fn into_response(self) -> Response {
        let status = match &self {
            BackupError::ArchiveNotFound(_) => StatusCode::NOT_FOUND,
            BackupError::AlreadyRunning(_) => StatusCode::CONFLICT,
            BackupError::InvalidArchive(_) | BackupError::UnsupportedFormat(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// List archives, newest first
async fn list_backups_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BackupArchive>>, BackupError> {
    Ok(Json(state.manager.list_backups().await?))
}

// Run a backup now
async fn create_backup_handler(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<BackupReport>), BackupError> {
    let report = state.manager.create_backup().await?;
    Ok((StatusCode::CREATED, Json(report)))
}

#[derive(Deserialize)]
struct RestoreRequest {
    /// Archive file name or absolute path
    archive: String,
}

// Restore from an archive
async fn restore_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<RestoreReport>, BackupError> {
    Ok(Json(state.manager.restore_backup(&request.archive).await?))
}

fn router(manager: Arc<BackupManager>) -> Router {
    Router::new()
        .route("/api/backups", get(list_backups_handler).post(create_backup_handler))
        .route("/api/backups/restore", post(restore_handler))
        .with_state(Arc::new(AppState { manager }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = BackupConfig::from_env()?;

    let pool = db::init_pool(&config.database.native_url()).await?;
    info!("Connected to database {}", config.database.name);

    let directory =
        ArchiveDirectory::resolve(&config.backup_dir, &config.fallback_backup_dir).await?;
    let manager = Arc::new(BackupManager::new(
        &config,
        directory,
        Arc::new(TokioProcessRunner::new(config.max_output_bytes)),
        Arc::new(db::PgEntityStore::new(pool)),
        create_remote_uploader(&config).await,
        Arc::new(LogAlertSink),
    ));
    info!("Backups are stored in {}", manager.backup_dir().display());

    if let Some(expression) = &config.schedule {
        BackupScheduler::new(expression)?.start(manager.clone());
    } else {
        info!("Scheduled backups disabled");
    }

    let app = router(manager);

    info!("Server starting on http://{}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let cases = [
            (BackupError::ArchiveNotFound(String::from("x.tar.gz")), StatusCode::NOT_FOUND),
            (BackupError::AlreadyRunning("backup"), StatusCode::CONFLICT),
            (
                BackupError::InvalidArchive(String::from("empty")),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                BackupError::UnsupportedFormat(String::from("v9")),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                BackupError::DumpUnavailable(String::from("all failed")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
