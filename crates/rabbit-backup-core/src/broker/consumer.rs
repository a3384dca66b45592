//! Broker consumer: subscription deliveries in, acknowledgements back.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Acknowledger, Subscription};
use crate::message::{AckRequest, Message};
use crate::metrics::PerformanceMetrics;
use crate::{Error, Result};

/// Apply one ack request on `acker`
pub async fn apply_ack(acker: &dyn Acknowledger, request: AckRequest) -> Result<()> {
    debug!(
        "Acknowledging delivery tag {} (cumulative: {})",
        request.tag, request.cumulative
    );
    acker.ack(request.tag, request.cumulative).await
}

/// Forwards deliveries from a subscription into a bounded queue and applies
/// ack requests coming back from the archive writer.
///
/// Ack requests are applied on their own task, so a full message queue never
/// holds up acknowledgements.
pub struct BrokerConsumer {
    subscription: Box<dyn Subscription>,
    acker: Arc<dyn Acknowledger>,
    idle_timeout: Option<Duration>,
    metrics: Arc<PerformanceMetrics>,
}

impl BrokerConsumer {
    pub fn new(subscription: Box<dyn Subscription>, metrics: Arc<PerformanceMetrics>) -> Self {
        let acker = subscription.acknowledger();
        Self {
            subscription,
            acker,
            idle_timeout: None,
            metrics,
        }
    }

    /// End the subscription after `timeout` without a delivery
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Apply one ack request on this consumer's channel
    pub async fn apply_ack(&self, request: AckRequest) -> Result<()> {
        apply_ack(self.acker.as_ref(), request).await
    }

    /// Run until the subscription ends, `shutdown` fires, or a fatal error.
    ///
    /// On a clean stop the subscription is cancelled, `out` is closed so the
    /// writer seals its trailing unit, and every ack request the writer still
    /// emits is applied before the channel is closed. On a fatal error the
    /// channel is closed right away and outstanding deliveries stay
    /// unacknowledged. Returns the number of messages forwarded.
    pub async fn consume(
        mut self,
        out: mpsc::Sender<Message>,
        acks: mpsc::Receiver<AckRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64> {
        let mut ack_task = Some(spawn_ack_loop(
            Arc::clone(&self.acker),
            acks,
            Arc::clone(&self.metrics),
        ));
        let mut forwarded = 0u64;

        let outcome: Result<()> = loop {
            tokio::select! {
                biased;

                _ = requested(&mut shutdown) => {
                    info!("Shutdown requested, stopping message intake");
                    break Ok(());
                }

                joined = join_ack_loop(&mut ack_task) => {
                    match joined {
                        Ok(applied) => debug!("Ack loop ended after {} requests", applied),
                        Err(e) => break Err(e),
                    }
                }

                delivery = next_delivery(self.subscription.as_mut(), self.idle_timeout) => {
                    match delivery {
                        Some(Ok(message)) => {
                            let sent = tokio::select! {
                                biased;
                                _ = requested(&mut shutdown) => {
                                    info!("Shutdown requested, stopping message intake");
                                    None
                                }
                                sent = out.send(message) => Some(sent),
                            };
                            match sent {
                                Some(Ok(())) => forwarded += 1,
                                Some(Err(_)) => {
                                    debug!("Message queue closed by the writer");
                                    break Ok(());
                                }
                                None => break Ok(()),
                            }
                        }
                        Some(Err(e)) => break Err(e),
                        None => {
                            info!("Subscription ended after {} messages", forwarded);
                            break Ok(());
                        }
                    }
                }
            }
        };

        if let Err(e) = outcome {
            error!("Consumer stopped: {}", e);
            self.metrics.record_error();
            if let Some(task) = ack_task {
                task.abort();
            }
            if let Err(close_err) = self.subscription.close().await {
                debug!("Closing subscription after failure: {}", close_err);
            }
            return Err(e);
        }

        if let Err(e) = self.subscription.cancel().await {
            warn!("Failed to cancel subscription: {}", e);
        }
        drop(out);

        if let Some(task) = ack_task {
            match flatten(task.await) {
                Ok(applied) => debug!("Applied {} ack requests", applied),
                Err(e) => {
                    error!("Acknowledgement failed: {}", e);
                    self.metrics.record_error();
                    let _ = self.subscription.close().await;
                    return Err(e);
                }
            }
        }

        self.subscription.close().await?;
        info!("Consumer stopped after forwarding {} messages", forwarded);
        Ok(forwarded)
    }
}

/// Resolves once shutdown has been requested, including before the call
async fn requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn next_delivery(
    subscription: &mut dyn Subscription,
    idle_timeout: Option<Duration>,
) -> Option<Result<Message>> {
    let Some(timeout) = idle_timeout else {
        return subscription.next_delivery().await;
    };

    match tokio::time::timeout(timeout, subscription.next_delivery()).await {
        Ok(delivery) => delivery,
        Err(_) => {
            info!("No delivery for {:?}, ending subscription", timeout);
            None
        }
    }
}

fn spawn_ack_loop(
    acker: Arc<dyn Acknowledger>,
    mut acks: mpsc::Receiver<AckRequest>,
    metrics: Arc<PerformanceMetrics>,
) -> JoinHandle<Result<u64>> {
    tokio::spawn(async move {
        let mut applied = 0u64;
        while let Some(request) = acks.recv().await {
            apply_ack(acker.as_ref(), request).await?;
            metrics.record_ack();
            applied += 1;
        }
        Ok(applied)
    })
}

/// Wait for the ack loop if it is still running; pending forever otherwise
async fn join_ack_loop(task: &mut Option<JoinHandle<Result<u64>>>) -> Result<u64> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let joined = flatten(handle.await);
    *task = None;
    joined
}

fn flatten(joined: std::result::Result<Result<u64>, tokio::task::JoinError>) -> Result<u64> {
    joined.map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Ack task failed: {}", e),
        ))
    })?
}
