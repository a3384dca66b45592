//! Restore engine orchestration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::input::ArchiveInput;
use crate::archive::{parse_unit_key, ArchiveReader};
use crate::broker::{AmqpBroker, Broker, BrokerPublisher};
use crate::config::{Config, Mode};
use crate::flow::InFlight;
use crate::message::{Message, RoutingOverride};
use crate::metrics::PerformanceMetrics;
use crate::{Error, Result};

/// Outcome of a restore run
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Units read to the end
    pub units_restored: usize,
    /// Messages read from the units
    pub messages_read: u64,
    /// Messages confirmed by the broker
    pub messages_published: u64,
    /// Whether shutdown stopped the run before every unit was read
    pub interrupted: bool,
}

/// What the producer side of a run achieved
#[derive(Debug, Default)]
struct Produced {
    units: usize,
    messages: u64,
    interrupted: bool,
}

/// Restore engine: replays archive units into an exchange
pub struct RestoreEngine {
    config: Config,
    broker: Arc<dyn Broker>,
    metrics: Arc<PerformanceMetrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl RestoreEngine {
    /// Create a restore engine publishing to RabbitMQ
    pub fn new(config: Config) -> Result<Self> {
        let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(config.broker.clone()));
        Self::with_broker(config, broker)
    }

    /// Create a restore engine over an explicit broker
    pub fn with_broker(config: Config, broker: Arc<dyn Broker>) -> Result<Self> {
        config.validate()?;

        if config.mode != Mode::Restore {
            return Err(Error::Config(
                "Configuration mode must be 'restore'".to_string(),
            ));
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            broker,
            metrics: Arc::new(PerformanceMetrics::new()),
            shutdown_tx,
        })
    }

    /// Stop reading further units; queued messages are still published.
    ///
    /// Latched: a request made before `run` stops it before the first unit.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Get metrics
    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    /// Run the restore
    pub async fn run(&self) -> Result<RestoreReport> {
        let result = self.run_internal().await;

        match &result {
            Ok(report) => info!(
                "Restore complete: {} messages from {} units",
                report.messages_published, report.units_restored
            ),
            Err(e) => {
                error!("Restore failed: {}", e);
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

    async fn run_internal(&self) -> Result<RestoreReport> {
        let input_path = self
            .config
            .restore
            .as_ref()
            .map(|r| r.input.clone())
            .ok_or_else(|| Error::Config("Restore options required".to_string()))?;
        let input = ArchiveInput::resolve(&input_path)?;

        let broker = &self.config.broker;
        let routing = RoutingOverride::from_flag(&broker.routing_key);
        info!(
            "Restoring {} units from {} to exchange {} ({:?})",
            input.len(),
            input_path.display(),
            broker.exchange,
            routing
        );

        let channel = self.broker.publish_channel(&broker.exchange).await?;

        let in_flight = InFlight::new();
        let publisher = BrokerPublisher::new(
            channel,
            routing,
            in_flight.clone(),
            Arc::clone(&self.metrics),
        );
        let (message_tx, message_rx) = mpsc::channel(usize::from(broker.prefetch));

        let (produced, messages_published) = tokio::try_join!(
            produce(
                input.into_units(),
                message_tx,
                in_flight,
                self.shutdown_tx.subscribe(),
            ),
            publisher.publish_all(message_rx),
        )?;

        if produced.interrupted {
            warn!(
                "Restore interrupted after {} units, remaining units were not read",
                produced.units
            );
        }

        Ok(RestoreReport {
            units_restored: produced.units,
            messages_read: produced.messages,
            messages_published,
            interrupted: produced.interrupted,
        })
    }
}

/// Read every unit into `messages`, one unit at a time.
///
/// The queue is only closed once every queued message has been published,
/// including after a decode error, so messages already read from a broken
/// unit still reach the broker.
async fn produce(
    units: Vec<PathBuf>,
    messages: mpsc::Sender<Message>,
    in_flight: InFlight,
    shutdown: watch::Receiver<bool>,
) -> Result<Produced> {
    let mut produced = Produced::default();

    let result: Result<()> = async {
        for path in units {
            let stop = *shutdown.borrow();
            if stop {
                info!("Shutdown requested, not reading further units");
                produced.interrupted = true;
                break;
            }

            let tx = messages.clone();
            let flight = in_flight.clone();
            let unpacked = tokio::task::spawn_blocking(move || unpack_unit(&path, &tx, &flight))
                .await
                .map_err(|e| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("Unpack task failed: {}", e),
                    ))
                })??;

            produced.messages += unpacked.messages;
            if unpacked.publisher_gone {
                debug!("Publisher stopped, no further units are read");
                break;
            }
            produced.units += 1;
        }
        Ok(())
    }
    .await;

    in_flight.wait_idle().await;
    drop(messages);

    result.map(|_| produced)
}

struct Unpacked {
    messages: u64,
    publisher_gone: bool,
}

/// Stream one unit into the queue; blocks while the queue is full
fn unpack_unit(
    path: &Path,
    messages: &mpsc::Sender<Message>,
    in_flight: &InFlight,
) -> Result<Unpacked> {
    let mut reader = ArchiveReader::open(path)?;
    let mut count = 0u64;

    for message in reader.messages()? {
        let message = message?;
        in_flight.begin();
        if messages.blocking_send(message).is_err() {
            in_flight.complete();
            return Ok(Unpacked {
                messages: count,
                publisher_gone: true,
            });
        }
        count += 1;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some((_, expected)) = parse_unit_key(&name) {
        if expected as u64 != count {
            warn!(
                "{} is named for {} messages but holds {}",
                path.display(),
                expected,
                count
            );
        }
    }

    info!("Unpacked {} messages from {}", count, path.display());
    Ok(Unpacked {
        messages: count,
        publisher_gone: false,
    })
}
