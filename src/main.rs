use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod database;

use config::{BackupArgs, Config};
use database::backup::BackupJob;
use database::dump::MysqlDumpRunner;
use database::storage::sftp_storage::SftpStore;

async fn run(args: BackupArgs) -> database::Result<()> {
    // Load and validate everything before touching the network
    let config = Arc::new(Config::from_file(&args.config)?);

    let store = Arc::new(SftpStore::connect(&config.sftp).await?);
    let dumper = Arc::new(MysqlDumpRunner::new(&config.mysql));
    let job = BackupJob::new(config, store, dumper)?;

    let report = job.run(args.number_of_backups as usize).await?;
    info!(
        "Backup {} uploaded ({} bytes), {} kept, {} deleted in {:?}",
        report.uploaded_path,
        report.size_bytes,
        report.kept.len(),
        report.deleted.len(),
        report.duration
    );

    Ok(())
}

#[tokio::main]
async fn main() {
    // Load .env file
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = BackupArgs::parse();

    if let Err(e) = run(args).await {
        error!("Backup failed: {}", e);
        std::process::exit(1);
    }
}
