//! Backup run orchestration
//!
//! One run lists the remote folder, selects which existing backups survive,
//! dumps the database, uploads the dump and finally prunes the backups that
//! fell out of the retention window. Every step finishes before the next one
//! starts and the first failure ends the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use tracing::{debug, info};

use crate::config::{Config, keys};
use crate::database::{BackupError, Result};
use crate::database::backup_naming::NamingPattern;
use crate::database::dump::DumpRunner;
use crate::database::retention::{RetentionPartition, select_retention};
use crate::database::storage::{RemoteStore, remote_path};

/// Result of a backup run
#[derive(Debug, Clone)]
pub struct BackupReport {
    /// Remote path of the new backup
    pub uploaded_path: String,
    /// Size of the new backup in bytes
    pub size_bytes: u64,
    /// Existing backups left in place
    pub kept: Vec<String>,
    /// Remote paths of the backups that were deleted
    pub deleted: Vec<String>,
    /// Duration of the run
    pub duration: Duration,
}

/// Runs a backup against a remote store
pub struct BackupJob {
    /// Run configuration
    config: Arc<Config>,
    /// Naming pattern built from the `[General]` section
    pattern: NamingPattern,
    /// Remote store holding the backups
    store: Arc<dyn RemoteStore>,
    /// Producer of the database dump
    dumper: Arc<dyn DumpRunner>,
}

impl BackupJob {
    /// Create a new backup job
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn RemoteStore>,
        dumper: Arc<dyn DumpRunner>,
    ) -> Result<Self> {
        let pattern = NamingPattern::from_config(&config.naming)?;
        Ok(Self {
            config,
            pattern,
            store,
            dumper,
        })
    }

    /// Run the backup, keeping the `keep_count` newest existing backups
    pub async fn run(&self, keep_count: usize) -> Result<BackupReport> {
        self.run_at(keep_count, Local::now().naive_local()).await
    }

    /// Run the backup naming the new file after `timestamp` (primarily for testing)
    pub async fn run_at(&self, keep_count: usize, timestamp: NaiveDateTime) -> Result<BackupReport> {
        let start_time = Instant::now();
        let folder = &self.config.sftp.folder;

        let partition = self.plan_retention(keep_count).await?;

        // The filename is rendered and checked before the dump so a bad date format fails early
        let filename = self
            .pattern
            .generate_filename_with_time(&self.config.mysql.db_name, timestamp)?;
        if !self.pattern.matches(&filename) {
            return Err(BackupError::Pattern(format!(
                "new backup {} would not match its own naming pattern, check {} against {}",
                filename, keys::DATE_REGEX, keys::DATE_FORMAT
            )));
        }
        let uploaded_path = remote_path(folder, &filename);

        let buffer = self.dumper.dump().await?;
        info!("Dumping to: {}", uploaded_path);
        let size_bytes = self.store.upload(buffer, &uploaded_path).await?;

        let deleted = self.delete_old_backups(&partition.delete).await?;

        Ok(BackupReport {
            uploaded_path,
            size_bytes,
            kept: partition.keep,
            deleted,
            duration: start_time.elapsed(),
        })
    }

    /// List the remote folder and split the existing backups
    pub async fn plan_retention(&self, keep_count: usize) -> Result<RetentionPartition> {
        let folder = &self.config.sftp.folder;
        let listing = self.store.list(folder).await?;
        debug!("Found {} entries in {}", listing.len(), folder);

        let partition = select_retention(&listing, &self.pattern, keep_count)?;
        info!(
            "Keeping {} existing backups, {} to delete",
            partition.keep.len(),
            partition.delete.len()
        );
        Ok(partition)
    }

    /// Delete backups by file name, returning their remote paths
    async fn delete_old_backups(&self, filenames: &[String]) -> Result<Vec<String>> {
        let folder = &self.config.sftp.folder;
        let mut deleted = Vec::with_capacity(filenames.len());

        for filename in filenames {
            let path = remote_path(folder, filename);
            debug!("Deleting old backup {}", path);
            self.store.delete(&path).await?;
            deleted.push(path);
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::database::dump::{DumpBuffer, MockDumpRunner};
    use crate::database::storage::MockRemoteStore;
    use chrono::NaiveDate;
    use mockall::Sequence;
    use std::io::Read;

    fn timestamp() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 4)
            .unwrap()
            .and_hms_opt(3, 0, 0)
            .unwrap()
    }

    fn listing() -> Vec<String> {
        [
            "db_shop_20240101.sql",
            "db_shop_20240103.sql",
            "readme.txt",
            "db_shop_20240102.sql",
        ]
        .iter()
        .map(|name| name.to_string())
        .collect()
    }

    fn dumper_returning(content: &'static [u8]) -> MockDumpRunner {
        let mut dumper = MockDumpRunner::new();
        dumper
            .expect_dump()
            .times(1)
            .returning(move || Ok(DumpBuffer::from_bytes(content).unwrap()));
        dumper
    }

    fn job(store: MockRemoteStore, dumper: MockDumpRunner) -> BackupJob {
        BackupJob::new(Arc::new(sample_config()), Arc::new(store), Arc::new(dumper)).unwrap()
    }

    #[tokio::test]
    async fn test_run_uploads_and_prunes() {
        let mut seq = Sequence::new();
        let mut store = MockRemoteStore::new();

        store
            .expect_list()
            .withf(|folder| folder == "/backups")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(listing()));
        store
            .expect_upload()
            .withf(|_, destination| destination == "/backups/db_shop_20240104.sql")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|mut buffer, _| {
                let mut content = String::new();
                buffer.read_to_string(&mut content).unwrap();
                assert_eq!(content, "-- dump");
                Ok(content.len() as u64)
            });
        store
            .expect_delete()
            .withf(|path| path == "/backups/db_shop_20240101.sql")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let report = job(store, dumper_returning(b"-- dump"))
            .run_at(2, timestamp())
            .await
            .unwrap();

        assert_eq!(report.uploaded_path, "/backups/db_shop_20240104.sql");
        assert_eq!(report.size_bytes, 7);
        assert_eq!(report.kept, vec!["db_shop_20240103.sql", "db_shop_20240102.sql"]);
        assert_eq!(report.deleted, vec!["/backups/db_shop_20240101.sql"]);
    }

    #[tokio::test]
    async fn test_run_with_nothing_to_prune() {
        let mut store = MockRemoteStore::new();
        store.expect_list().returning(|_| Ok(listing()));
        store.expect_upload().times(1).returning(|_, _| Ok(7));
        store.expect_delete().times(0);

        let report = job(store, dumper_returning(b"-- dump"))
            .run_at(5, timestamp())
            .await
            .unwrap();

        assert_eq!(report.kept.len(), 3);
        assert!(report.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_run_on_empty_folder() {
        let mut store = MockRemoteStore::new();
        store.expect_list().returning(|_| Ok(Vec::new()));
        store.expect_upload().times(1).returning(|_, _| Ok(7));
        store.expect_delete().times(0);

        let report = job(store, dumper_returning(b"-- dump"))
            .run_at(1, timestamp())
            .await
            .unwrap();

        assert!(report.kept.is_empty());
        assert!(report.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_stops_run() {
        let mut store = MockRemoteStore::new();
        store
            .expect_list()
            .returning(|_| Err(BackupError::Listing("permission denied".to_string())));
        store.expect_upload().times(0);
        store.expect_delete().times(0);

        let mut dumper = MockDumpRunner::new();
        dumper.expect_dump().times(0);

        let err = job(store, dumper).run_at(2, timestamp()).await.unwrap_err();
        assert!(matches!(err, BackupError::Listing(_)));
    }

    #[tokio::test]
    async fn test_unparseable_listing_stops_run() {
        let mut store = MockRemoteStore::new();
        store
            .expect_list()
            .returning(|_| Ok(vec!["db_shop_20241341.sql".to_string()]));
        store.expect_upload().times(0);
        store.expect_delete().times(0);

        let mut dumper = MockDumpRunner::new();
        dumper.expect_dump().times(0);

        let err = job(store, dumper).run_at(2, timestamp()).await.unwrap_err();
        assert!(matches!(err, BackupError::DateParse { .. }));
    }

    #[tokio::test]
    async fn test_dump_failure_skips_upload_and_prune() {
        let mut store = MockRemoteStore::new();
        store.expect_list().returning(|_| Ok(listing()));
        store.expect_upload().times(0);
        store.expect_delete().times(0);

        let mut dumper = MockDumpRunner::new();
        dumper
            .expect_dump()
            .times(1)
            .returning(|| Err(BackupError::Dump("mysqldump exited with 2".to_string())));

        let err = job(store, dumper).run_at(2, timestamp()).await.unwrap_err();
        assert!(matches!(err, BackupError::Dump(_)));
    }

    #[tokio::test]
    async fn test_upload_failure_skips_prune() {
        let mut store = MockRemoteStore::new();
        store.expect_list().returning(|_| Ok(listing()));
        store
            .expect_upload()
            .times(1)
            .returning(|_, _| Err(BackupError::Upload("disk full".to_string())));
        store.expect_delete().times(0);

        let err = job(store, dumper_returning(b"-- dump"))
            .run_at(1, timestamp())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Upload(_)));
    }

    #[tokio::test]
    async fn test_delete_failure_stops_pruning() {
        let mut store = MockRemoteStore::new();
        store.expect_list().returning(|_| Ok(listing()));
        store.expect_upload().times(1).returning(|_, _| Ok(7));
        // Newest of the two doomed backups goes first and fails
        store
            .expect_delete()
            .withf(|path| path == "/backups/db_shop_20240102.sql")
            .times(1)
            .returning(|_| Err(BackupError::Delete("no such file".to_string())));
        store
            .expect_delete()
            .withf(|path| path == "/backups/db_shop_20240101.sql")
            .times(0);

        let err = job(store, dumper_returning(b"-- dump"))
            .run_at(1, timestamp())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Delete(_)));
    }

    #[tokio::test]
    async fn test_plan_retention() {
        let mut store = MockRemoteStore::new();
        store.expect_list().returning(|_| Ok(listing()));

        let job = job(store, MockDumpRunner::new());
        let partition = job.plan_retention(1).await.unwrap();

        assert_eq!(partition.keep, vec!["db_shop_20240103.sql"]);
        assert_eq!(
            partition.delete,
            vec!["db_shop_20240102.sql", "db_shop_20240101.sql"]
        );
    }

    #[tokio::test]
    async fn test_unrecognizable_filename_stops_run() {
        // Date regex expects six digits but the format renders eight
        let mut config = sample_config();
        config.naming.date_regex = r"\d{6}".to_string();

        let mut store = MockRemoteStore::new();
        store.expect_list().returning(|_| Ok(Vec::new()));
        store.expect_upload().times(0);
        store.expect_delete().times(0);

        let mut dumper = MockDumpRunner::new();
        dumper.expect_dump().times(0);

        let job = BackupJob::new(Arc::new(config), Arc::new(store), Arc::new(dumper)).unwrap();
        let err = job.run_at(2, timestamp()).await.unwrap_err();
        assert!(matches!(err, BackupError::Pattern(_)));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut config = sample_config();
        config.naming.filename_format = "db_{dbname}.sql".to_string();

        let result = BackupJob::new(
            Arc::new(config),
            Arc::new(MockRemoteStore::new()),
            Arc::new(MockDumpRunner::new()),
        );
        assert!(matches!(result, Err(BackupError::Pattern(_))));
    }
}
