use anyhow::{Context, Result};
use rabbit_backup_core::{Mode, RestoreEngine, RestoreOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::{load_config, spawn_signal_handler, BrokerArgs};

pub async fn run(config_path: Option<&str>, broker: &BrokerArgs, path: Option<String>) -> Result<()> {
    let mut config = load_config(config_path, Mode::Restore, broker).await?;

    if let Some(path) = path {
        config.restore = Some(RestoreOptions {
            input: PathBuf::from(path),
        });
    }
    let input = config
        .restore
        .as_ref()
        .map(|r| r.input.display().to_string())
        .context("An input file or directory is required (-f)")?;

    info!("Starting restore from: {}", input);

    let engine = Arc::new(RestoreEngine::new(config)?);

    let signals = spawn_signal_handler("finishing the current unit", {
        let engine = Arc::clone(&engine);
        move || engine.shutdown()
    });

    let result = engine.run().await;
    signals.abort();

    let report = result?;
    if report.interrupted {
        warn!(
            "Restore stopped early: {} units, {} messages published",
            report.units_restored, report.messages_published
        );
        return Ok(());
    }

    info!("Restore completed successfully");
    Ok(())
}
