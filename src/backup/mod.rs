//! Backup and disaster-recovery for the panel's persisted state
//!
//! A backup run dumps the database (native tools first, structured JSON
//! export as the last resort), collects TLS material and the active config
//! file, packs everything into a single `.tar.gz` and enforces retention.
//! Restores replay either dump format back into the live database.

pub mod alert;
pub mod archive;
pub mod dump;
pub mod entities;
pub mod export;
pub mod fallback;
pub mod manager;
pub mod naming;
pub mod process;
pub mod restore;
pub mod scheduler;
pub mod sidecar;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

/// Name of the SQL dump inside a snapshot directory
pub const SQL_DUMP_FILE: &str = "database.sql";

/// Name of the structured export inside a snapshot directory
pub const JSON_EXPORT_FILE: &str = "database.json";

/// Directory holding certificate material inside a snapshot directory
pub const CERTS_DIR: &str = "certs";

/// Copy of the active config file inside a snapshot directory
pub const ENV_FILE: &str = ".env";

/// Error type for backup/restore operations
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("All dump methods failed: {0}")]
    DumpUnavailable(String),

    #[error("Backup archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("Invalid backup archive: {0}")]
    InvalidArchive(String),

    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("Backup directory is not writable: {0}")]
    FilesystemPermission(String),

    #[error("{program} failed: {message}")]
    SubprocessFailure { program: String, message: String },

    #[error("Remote storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid schedule '{expression}': {message}")]
    InvalidSchedule { expression: String, message: String },

    #[error("A {0} is already in progress")]
    AlreadyRunning(&'static str),
}

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;
