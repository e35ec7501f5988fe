//! Database dump capture
//!
//! Runs the external dump utility with an argument vector and spools its
//! standard output into a buffer that stays in memory up to a threshold and
//! moves to an anonymous temporary file past it.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::process::{Command, Stdio};

use async_trait::async_trait;
use tempfile::SpooledTempFile;
use tracing::{debug, info};

use crate::config::{MySqlConfig, Secret};
use crate::database::{BackupError, Result};

/// Dumps larger than this are spilled to a temporary file
pub const SPOOL_THRESHOLD: usize = 10 * 1024 * 1024;

const REDACTED: &str = "******";

/// Captured dump output
#[derive(Debug)]
pub struct DumpBuffer {
    file: SpooledTempFile,
    len: u64,
}

impl DumpBuffer {
    /// Create an empty buffer spilling to disk past `threshold` bytes
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            file: SpooledTempFile::new(threshold),
            len: 0,
        }
    }

    /// Create a buffer from in-memory bytes, positioned at the start
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let mut buffer = Self::default();
        buffer.write_all(bytes)?;
        buffer.rewind()?;
        Ok(buffer)
    }

    /// Number of bytes written
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the contents moved to a temporary file
    pub fn is_spilled(&self) -> bool {
        self.file.is_rolled()
    }

    /// Move back to the start for reading
    pub fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

impl Default for DumpBuffer {
    fn default() -> Self {
        Self::with_threshold(SPOOL_THRESHOLD)
    }
}

impl Write for DumpBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        self.len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Read for DumpBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Produces a dump of the configured database
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DumpRunner: Send + Sync {
    /// Run the dump and return its output positioned at the start
    async fn dump(&self) -> Result<DumpBuffer>;
}

/// Command line of the dump utility
#[derive(Debug, Clone)]
pub struct DumpCommand {
    program: String,
    username: String,
    password: Secret,
    host: String,
    port: u16,
    database: String,
}

impl DumpCommand {
    pub fn from_config(config: &MySqlConfig) -> Self {
        Self {
            program: config.dump_command.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            host: config.host.clone(),
            port: config.port,
            database: config.db_name.clone(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments handed to the process, including the password
    pub fn args(&self) -> Vec<String> {
        self.build_args(self.password.expose())
    }

    fn build_args(&self, password: &str) -> Vec<String> {
        vec![
            format!("--user={}", self.username),
            format!("--password={}", password),
            format!("--host={}", self.host),
            format!("--port={}", self.port),
            self.database.clone(),
        ]
    }

    /// Strip the password from text produced by the command
    fn redact(&self, text: &str) -> String {
        let password = self.password.expose();
        if password.is_empty() {
            text.to_string()
        } else {
            text.replace(password, REDACTED)
        }
    }
}

impl fmt::Display for DumpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in self.build_args(REDACTED) {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs `mysqldump` (or the configured replacement) as a subprocess
pub struct MysqlDumpRunner {
    command: DumpCommand,
    spool_threshold: usize,
}

impl MysqlDumpRunner {
    pub fn new(config: &MySqlConfig) -> Self {
        Self::with_command(DumpCommand::from_config(config))
    }

    pub fn with_command(command: DumpCommand) -> Self {
        Self {
            command,
            spool_threshold: SPOOL_THRESHOLD,
        }
    }

    /// Override the in-memory limit of the dump buffer
    pub fn spool_threshold(mut self, threshold: usize) -> Self {
        self.spool_threshold = threshold;
        self
    }
}

#[async_trait]
impl DumpRunner for MysqlDumpRunner {
    async fn dump(&self) -> Result<DumpBuffer> {
        let command = self.command.clone();
        let threshold = self.spool_threshold;
        tokio::task::spawn_blocking(move || run_dump(&command, threshold)).await?
    }
}

fn run_dump(command: &DumpCommand, threshold: usize) -> Result<DumpBuffer> {
    info!("Running: {}", command);

    let mut stderr = tempfile::tempfile()?;
    let mut child = Command::new(&command.program)
        .args(command.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(stderr.try_clone()?))
        .spawn()
        .map_err(|e| BackupError::Dump(format!("failed to start {}: {}", command.program, e)))?;

    let mut buffer = DumpBuffer::with_threshold(threshold);
    let copied = match child.stdout.take() {
        Some(mut stdout) => io::copy(&mut stdout, &mut buffer),
        None => Err(io::Error::other("dump output was not captured")),
    };
    // Reap the child even when the copy failed
    let status = child.wait()?;
    copied?;

    if !status.success() {
        let mut output = Vec::new();
        stderr.seek(SeekFrom::Start(0))?;
        stderr.read_to_end(&mut output)?;
        let output = command.redact(String::from_utf8_lossy(&output).trim());
        return Err(BackupError::Dump(format!(
            "{} exited with {}: {}",
            command, status, output
        )));
    }

    buffer.flush()?;
    buffer.rewind()?;
    debug!(
        "Dump captured {} bytes (spilled to disk: {})",
        buffer.len(),
        buffer.is_spilled()
    );
    Ok(buffer)
}
