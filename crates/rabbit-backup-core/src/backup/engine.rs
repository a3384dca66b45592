//! Backup engine orchestration.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::archive::{ArchiveWriter, ArchiveWriterConfig, SealedUnit};
use crate::broker::{AmqpBroker, Broker, BrokerConsumer, SubscribeOptions};
use crate::config::{Config, Mode};
use crate::message::Message;
use crate::metrics::PerformanceMetrics;
use crate::storage::{create_backend, StorageBackend};
use crate::{Error, Result};

/// Capacity of the writer -> consumer ack request queue
const ACK_QUEUE_CAPACITY: usize = 64;

/// One sealed unit, as reported at the end of a run
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub key: String,
    pub location: String,
    pub message_count: usize,
    pub compressed_size: u64,
}

impl From<&SealedUnit> for UnitReport {
    fn from(unit: &SealedUnit) -> Self {
        Self {
            key: unit.key.clone(),
            location: unit.location.clone(),
            message_count: unit.message_count,
            compressed_size: unit.compressed_size,
        }
    }
}

/// Outcome of a backup run
#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    /// Messages received from the broker
    pub messages_consumed: u64,
    /// Units sealed, in order
    pub units: Vec<UnitReport>,
}

impl BackupReport {
    /// Messages held by the sealed units
    pub fn messages_archived(&self) -> u64 {
        self.units.iter().map(|u| u.message_count as u64).sum()
    }
}

/// Backup engine: drains a queue into sealed archive units
pub struct BackupEngine {
    config: Config,
    broker: Arc<dyn Broker>,
    storage: Arc<dyn StorageBackend>,
    mirror: Option<Arc<dyn StorageBackend>>,
    metrics: Arc<PerformanceMetrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl BackupEngine {
    /// Create a backup engine talking to RabbitMQ
    pub fn new(config: Config) -> Result<Self> {
        let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(config.broker.clone()));
        let storage = create_backend(&config.storage)?;
        let mirror = config.upload.as_ref().map(create_backend).transpose()?;

        let mut engine = Self::with_broker(config, broker, storage)?;
        engine.mirror = mirror;
        Ok(engine)
    }

    /// Create a backup engine over an explicit broker and storage backend
    pub fn with_broker(
        config: Config,
        broker: Arc<dyn Broker>,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        config.validate()?;

        if config.mode != Mode::Backup {
            return Err(Error::Config(
                "Configuration mode must be 'backup'".to_string(),
            ));
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            broker,
            storage,
            mirror: None,
            metrics: Arc::new(PerformanceMetrics::new()),
            shutdown_tx,
        })
    }

    /// Also upload every sealed unit to `mirror`, best effort
    pub fn with_mirror(mut self, mirror: Arc<dyn StorageBackend>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Get a shutdown signal receiver; it already reads `true` once
    /// shutdown has been requested
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop message intake; the run seals and acknowledges what it holds.
    ///
    /// The request is latched, so it also stops a run that has not
    /// subscribed yet.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Get metrics
    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    /// Run the backup until the subscription ends, shutdown is requested,
    /// or a stage fails.
    pub async fn run(&self) -> Result<BackupReport> {
        let result = self.run_internal().await;

        match &result {
            Ok(report) => {
                info!(
                    "Backup complete: {} messages in {} units",
                    report.messages_archived(),
                    report.units.len()
                );
            }
            Err(e) => {
                error!("Backup failed: {}", e);
                self.metrics.record_error();
            }
        }
        let report = self.metrics.report();
        info!("{}", report);
        if let Ok(json) = report.to_json() {
            debug!("Metrics: {}", json);
        }

        result
    }

    async fn run_internal(&self) -> Result<BackupReport> {
        let options = self.config.backup_options();
        let broker = &self.config.broker;

        info!(
            "Backing up queue {} to {} (batch size {}, {:?})",
            broker.queue,
            self.storage.location(""),
            options.batch_size,
            options.compression
        );

        // Subscribe before anything else so a missing queue fails fast
        let subscription = self
            .broker
            .subscribe(&SubscribeOptions::for_backup(broker, options.batch_size))
            .await?;
        let consumer = BrokerConsumer::new(subscription, Arc::clone(&self.metrics))
            .with_idle_timeout(options.idle_timeout_secs.map(Duration::from_secs));

        let (message_tx, message_rx) = mpsc::channel(usize::from(broker.prefetch));
        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_CAPACITY);

        let mut writer = ArchiveWriter::new(
            ArchiveWriterConfig::from(&options),
            Arc::clone(&self.storage),
            ack_tx,
            Arc::clone(&self.metrics),
        )?;
        if let Some(mirror) = &self.mirror {
            writer = writer.with_mirror(Arc::clone(mirror));
        }

        let shutdown_rx = self.shutdown_receiver();

        // The first failing stage cancels the other: a consumer failure never
        // seals the open unit, a writer failure stops intake
        let (messages_consumed, units) = tokio::try_join!(
            consumer.consume(message_tx, ack_rx, shutdown_rx),
            write_units(writer, message_rx),
        )?;

        Ok(BackupReport {
            messages_consumed,
            units,
        })
    }
}

/// Feed every queued message to the writer, then seal the trailing unit
async fn write_units(
    mut writer: ArchiveWriter,
    mut messages: mpsc::Receiver<Message>,
) -> Result<Vec<UnitReport>> {
    let mut units = Vec::new();

    while let Some(message) = messages.recv().await {
        if let Some(unit) = writer.accept(message).await? {
            units.push(UnitReport::from(&unit));
        }
    }

    debug!("Message queue closed with {} messages pending", writer.pending());
    if let Some(unit) = writer.finish().await? {
        units.push(UnitReport::from(&unit));
    }

    Ok(units)
}
