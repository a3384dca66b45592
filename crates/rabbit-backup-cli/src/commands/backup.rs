use anyhow::Result;
use rabbit_backup_core::storage::StorageBackendConfig;
use rabbit_backup_core::{BackupEngine, Mode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::{load_config, spawn_signal_handler, BrokerArgs};

/// Backup flags
#[derive(Debug, Default)]
pub struct BackupArgs {
    pub dir: Option<String>,
    pub batch: Option<usize>,
    pub compression: Option<String>,
    pub compression_level: Option<i32>,
    pub idle_timeout: Option<u64>,
    pub upload: Option<String>,
}

pub async fn run(config_path: Option<&str>, broker: &BrokerArgs, args: BackupArgs) -> Result<()> {
    let mut config = load_config(config_path, Mode::Backup, broker).await?;

    if let Some(dir) = args.dir {
        config.storage = StorageBackendConfig::Filesystem {
            path: PathBuf::from(dir),
        };
    }
    if let Some(upload) = &args.upload {
        config.upload = Some(StorageBackendConfig::from_url(upload)?);
    }

    let mut options = config.backup.take().unwrap_or_default();
    if let Some(batch) = args.batch {
        options.batch_size = batch;
    }
    if let Some(compression) = &args.compression {
        options.compression = compression.parse()?;
    }
    if args.compression_level.is_some() {
        options.compression_level = args.compression_level;
    }
    if args.idle_timeout.is_some() {
        options.idle_timeout_secs = args.idle_timeout;
    }
    config.backup = Some(options);

    info!("Starting backup of queue: {}", config.broker.queue);

    let engine = Arc::new(BackupEngine::new(config)?);

    let signals = spawn_signal_handler("sealing the open unit", {
        let engine = Arc::clone(&engine);
        move || engine.shutdown()
    });

    let result = engine.run().await;
    signals.abort();

    let report = result?;
    if report.units.is_empty() {
        warn!("No messages were backed up");
    }
    for unit in &report.units {
        info!("  {} ({} messages)", unit.location, unit.message_count);
    }

    info!("Backup completed successfully");
    Ok(())
}
