//! Storage module for the remote backup folder
//!
//! This module provides an abstraction over the remote store holding the
//! backups, so the backup job can list, upload and prune without knowing
//! which transport sits behind it.

use async_trait::async_trait;

use crate::database::Result;
use crate::database::dump::DumpBuffer;

pub mod sftp_storage;

/// Provides the remote operations a backup run needs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List the file names in a remote folder
    ///
    /// Returns bare names without the folder component, in listing order.
    async fn list(&self, folder: &str) -> Result<Vec<String>>;

    /// Upload the contents of a dump buffer to a remote path
    ///
    /// # Arguments
    /// * `buffer` - Dump output, positioned at its start
    /// * `destination` - Full remote path of the new backup
    ///
    /// Returns the number of bytes written.
    async fn upload(&self, buffer: DumpBuffer, destination: &str) -> Result<u64>;

    /// Delete a file from the remote store
    ///
    /// # Arguments
    /// * `path` - Full remote path of the file to delete
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Join a remote folder and a file name with `/`
pub fn remote_path(folder: &str, filename: &str) -> String {
    if folder.is_empty() {
        filename.to_string()
    } else if folder.ends_with('/') {
        format!("{}{}", folder, filename)
    } else {
        format!("{}/{}", folder, filename)
    }
}
