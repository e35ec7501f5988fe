//! Database backup to a remote store, including dump capture and retention pruning

pub mod storage;

pub mod backup;
pub mod backup_naming;
pub mod dump;
pub mod retention;

use crate::config::ConfigError;

/// Error type for a backup run
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid naming pattern: {0}")]
    Pattern(String),

    #[error("Cannot parse date {value:?} of backup {filename} with format {format:?}")]
    DateParse {
        filename: String,
        value: String,
        format: String,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Listing error: {0}")]
    Listing(String),

    #[error("Dump failed: {0}")]
    Dump(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Delete error: {0}")]
    Delete(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;
