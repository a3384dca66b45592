pub mod backup;
pub mod restore;

use anyhow::{Context, Result};
use clap::Args;
use rabbit_backup_core::{BrokerConfig, Config, Mode};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Broker flags shared by both commands
#[derive(Args, Debug, Default)]
pub struct BrokerArgs {
    /// AMQP URI
    #[arg(short = 'u', long, global = true)]
    pub uri: Option<String>,

    /// Exchange to publish to (restore) or bind the queue to (backup)
    #[arg(short = 'e', long, global = true)]
    pub exchange: Option<String>,

    /// Queue to back up
    #[arg(short = 'q', long, global = true)]
    pub queue: Option<String>,

    /// Binding key on backup, routing key override on restore ('#' keeps stored keys)
    #[arg(short = 'r', long = "routingkey", global = true)]
    pub routing_key: Option<String>,

    /// Consumer tag
    #[arg(short = 't', long, global = true)]
    pub tag: Option<String>,

    /// Prefetch limit and message queue capacity
    #[arg(short = 'p', long, global = true)]
    pub prefetch: Option<u16>,
}

impl BrokerArgs {
    fn apply(&self, broker: &mut BrokerConfig) {
        if let Some(uri) = &self.uri {
            broker.uri = uri.clone();
        }
        if let Some(exchange) = &self.exchange {
            broker.exchange = exchange.clone();
        }
        if let Some(queue) = &self.queue {
            broker.queue = queue.clone();
        }
        if let Some(routing_key) = &self.routing_key {
            broker.routing_key = routing_key.clone();
        }
        if let Some(tag) = &self.tag {
            broker.consumer_tag = tag.clone();
        }
        if let Some(prefetch) = self.prefetch {
            broker.prefetch = prefetch;
        }
    }
}

/// Load the configuration file if one was given, else start from defaults,
/// then apply the broker flags.
pub async fn load_config(path: Option<&str>, mode: Mode, broker: &BrokerArgs) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path))?;
            let config = Config::from_yaml(&content)?;
            if config.mode != mode {
                anyhow::bail!(
                    "Configuration file {} is for {:?}, not {:?}",
                    path,
                    config.mode,
                    mode
                );
            }
            config
        }
        None => {
            let mode_name = match mode {
                Mode::Backup => "backup",
                Mode::Restore => "restore",
            };
            Config::from_yaml(&format!("mode: {}", mode_name))?
        }
    };

    broker.apply(&mut config.broker);
    Ok(config)
}

/// Call `stop` on the first Ctrl-C or SIGTERM. A second signal exits
/// right away with status 130.
pub fn spawn_signal_handler<F>(action: &'static str, stop: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, {}", action);
        stop();

        shutdown_signal().await;
        warn!("Second shutdown signal received, exiting immediately");
        std::process::exit(130);
    })
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flags_override_defaults() {
        let args = BrokerArgs {
            queue: Some("events".to_string()),
            prefetch: Some(50),
            ..Default::default()
        };

        let config = load_config(None, Mode::Backup, &args).await.unwrap();
        assert_eq!(config.broker.queue, "events");
        assert_eq!(config.broker.prefetch, 50);
        assert_eq!(config.broker.routing_key, "#");
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn test_config_mode_must_match_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("restore.yaml");
        std::fs::write(&path, "mode: restore\n").unwrap();

        let result = load_config(path.to_str(), Mode::Backup, &BrokerArgs::default()).await;
        assert!(result.is_err());
    }
}
