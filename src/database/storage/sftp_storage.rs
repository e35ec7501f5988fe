//! SFTP implementation of the RemoteStore trait
//!
//! ssh2 is blocking, so every call runs on tokio's blocking pool and opens
//! its own SFTP channel on the shared session.

use std::io::{self, Write};
use std::net::TcpStream;
use std::path::Path;

use async_trait::async_trait;
use ssh2::Session;
use tracing::{debug, error, info};

use super::RemoteStore;
use crate::config::SftpConfig;
use crate::database::dump::DumpBuffer;
use crate::database::{BackupError, Result};

/// Provides SFTP storage for database backups
pub struct SftpStore {
    /// Authenticated SSH session
    session: Session,
    /// Remote host, for log messages
    host: String,
}

impl SftpStore {
    /// Connect and authenticate with the credentials of the `[SFTP]` section
    pub async fn connect(config: &SftpConfig) -> Result<Self> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || Self::connect_blocking(&config)).await?
    }

    fn connect_blocking(config: &SftpConfig) -> Result<Self> {
        let address = format!("{}:{}", config.host, config.port);
        debug!("Connecting to SFTP server {}", address);

        let tcp = TcpStream::connect((config.host.as_str(), config.port)).map_err(|e| {
            error!("Failed to reach SFTP server {}: {}", address, e);
            BackupError::Connection(format!("failed to reach {}: {}", address, e))
        })?;

        let mut session = Session::new().map_err(|e| map_ssh_error(e, "session setup"))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| map_ssh_error(e, "handshake"))?;
        session
            .userauth_password(&config.username, config.password.expose())
            .map_err(|e| map_ssh_error(e, "authentication"))?;

        if !session.authenticated() {
            return Err(BackupError::Connection(format!(
                "authentication as {} on {} was rejected",
                config.username, address
            )));
        }

        info!("Successfully connected to SFTP server {}", address);
        Ok(Self {
            session,
            host: config.host.clone(),
        })
    }
}

/// Map connection-stage ssh2 errors to BackupError
fn map_ssh_error(error: ssh2::Error, operation: &str) -> BackupError {
    error!("SFTP {} failed: {}", operation, error);
    BackupError::Connection(format!("{} failed: {}", operation, error))
}

#[async_trait]
impl RemoteStore for SftpStore {
    async fn list(&self, folder: &str) -> Result<Vec<String>> {
        let session = self.session.clone();
        let folder = folder.to_string();
        debug!("Listing {} on {}", folder, self.host);

        let names = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let listing_error =
                |e: ssh2::Error| BackupError::Listing(format!("cannot list {}: {}", folder, e));

            let sftp = session.sftp().map_err(listing_error)?;
            let entries = sftp.readdir(Path::new(&folder)).map_err(listing_error)?;

            let mut names = Vec::with_capacity(entries.len());
            for (path, stat) in entries {
                if stat.is_dir() {
                    continue;
                }
                match path.file_name().and_then(|name| name.to_str()) {
                    Some(name) => names.push(name.to_string()),
                    None => debug!("Skipping non UTF-8 entry {}", path.display()),
                }
            }
            Ok(names)
        })
        .await??;

        debug!("Found {} files on {}", names.len(), self.host);
        Ok(names)
    }

    async fn upload(&self, mut buffer: DumpBuffer, destination: &str) -> Result<u64> {
        let session = self.session.clone();
        let destination = destination.to_string();
        debug!(
            "Uploading {} bytes to {} on {}",
            buffer.len(),
            destination,
            self.host
        );

        tokio::task::spawn_blocking(move || -> Result<u64> {
            let upload_error = |e: &dyn std::fmt::Display| {
                error!("Failed to upload {}: {}", destination, e);
                BackupError::Upload(format!("cannot write {}: {}", destination, e))
            };

            let sftp = session.sftp().map_err(|e| upload_error(&e))?;
            let mut file = sftp
                .create(Path::new(&destination))
                .map_err(|e| upload_error(&e))?;
            let written = io::copy(&mut buffer, &mut file).map_err(|e| upload_error(&e))?;
            file.flush().map_err(|e| upload_error(&e))?;

            info!("Successfully uploaded {} ({} bytes)", destination, written);
            Ok(written)
        })
        .await?
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let session = self.session.clone();
        let path = path.to_string();
        debug!("Deleting {} on {}", path, self.host);

        tokio::task::spawn_blocking(move || -> Result<()> {
            let delete_error = |e: ssh2::Error| {
                error!("Failed to delete {}: {}", path, e);
                BackupError::Delete(format!("cannot delete {}: {}", path, e))
            };

            let sftp = session.sftp().map_err(delete_error)?;
            sftp.unlink(Path::new(&path)).map_err(delete_error)?;

            info!("Successfully deleted {}", path);
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;
    use std::net::TcpListener;

    fn sftp_config(port: u16) -> SftpConfig {
        SftpConfig {
            username: "uploader".to_string(),
            password: Secret::new("hunter2"),
            host: "127.0.0.1".to_string(),
            port,
            folder: "/backups".to_string(),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port, then close it so nothing is listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = SftpStore::connect(&sftp_config(port)).await.err().unwrap();
        assert!(matches!(err, BackupError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connect_without_ssh_server() {
        // A peer that accepts and hangs up fails the SSH handshake
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let err = SftpStore::connect(&sftp_config(port)).await.err().unwrap();
        assert!(matches!(err, BackupError::Connection(_)));
        server.join().unwrap();
    }

    // Needs a live server, e.g. SFTP_TEST_HOST=localhost SFTP_TEST_PORT=2222
    #[tokio::test]
    #[ignore]
    async fn test_sftp_operations() {
        let host = std::env::var("SFTP_TEST_HOST").unwrap();
        let port = std::env::var("SFTP_TEST_PORT").unwrap().parse().unwrap();
        let config = SftpConfig {
            username: std::env::var("SFTP_TEST_USER").unwrap(),
            password: Secret::new(std::env::var("SFTP_TEST_PASSWORD").unwrap()),
            host,
            port,
            folder: std::env::var("SFTP_TEST_FOLDER").unwrap(),
        };
        let store = SftpStore::connect(&config).await.unwrap();

        let path = crate::database::storage::remote_path(&config.folder, "db_test_20240101.sql");
        let written = store
            .upload(DumpBuffer::from_bytes(b"-- test dump").unwrap(), &path)
            .await
            .unwrap();
        assert_eq!(written, 12);

        let names = store.list(&config.folder).await.unwrap();
        assert!(names.contains(&"db_test_20240101.sql".to_string()));

        store.delete(&path).await.unwrap();
        let names = store.list(&config.folder).await.unwrap();
        assert!(!names.contains(&"db_test_20240101.sql".to_string()));
    }
}
