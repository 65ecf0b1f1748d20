use crate::convert::SerializedBatch;
use crate::latency::LatencyTracker;
use async_trait::async_trait;
use pulsar::{producer, Producer, Pulsar, TokioExecutor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("pulsar error: {0}")]
    Pulsar(#[from] pulsar::Error),

    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Counters for the publication stage.
#[derive(Debug, Default, Clone)]
pub struct PublishMetrics {
    /// IPC messages acked by the broker.
    pub num_ipc_published: u64,
    /// JSON records covered by those messages.
    pub num_jsons_published: u64,
    /// Cumulative time spent inside publish calls.
    pub publish_time: Duration,
    /// Wall time of the publish task.
    pub thread_time: Duration,
}

/// Destination seam: publish one payload and block until it is acked.
///
/// The pipeline holds exactly one publisher, so wire order follows the
/// order messages are drained from the IPC queue.
#[async_trait]
pub trait BatchPublisher: Send {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), PublishError>;

    async fn close(&mut self) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Pulsar producer behind the publisher seam.
pub struct PulsarPublisher {
    producer: Producer<TokioExecutor>,
}

impl PulsarPublisher {
    pub async fn connect(url: &str, topic: &str) -> Result<Self, PublishError> {
        info!(url, topic, "Connecting Pulsar producer");
        let client = Pulsar::builder(url, TokioExecutor).build().await?;
        let producer = client
            .producer()
            .with_topic(topic)
            .with_name("bolson")
            .build()
            .await?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl BatchPublisher for PulsarPublisher {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), PublishError> {
        let message = producer::Message {
            payload: payload.to_vec(),
            ..Default::default()
        };
        // The second await blocks until the broker acks the message.
        self.producer.send(message).await?.await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PublishError> {
        self.producer.close().await?;
        Ok(())
    }
}

/// Drain the IPC queue and publish each message.
///
/// Successful publications stamp the latency tracker and add the message's
/// record count to `published_count`, which the supervisor compares against
/// the receiver's total. A failed publish is fatal: the flag trips and the
/// error surfaces through the returned result.
pub async fn run_publisher(
    mut publisher: Box<dyn BatchPublisher>,
    mut ipc_rx: mpsc::Receiver<SerializedBatch>,
    latency: LatencyTracker,
    published_count: Arc<AtomicU64>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<PublishMetrics, PublishError> {
    let thread_start = Instant::now();
    let mut metrics = PublishMetrics::default();
    debug!("Publisher started");

    loop {
        let taken = tokio::select! {
            message = ipc_rx.recv() => message,
            _ = shutdown.wait_for(|stop| *stop) => None,
        };
        let Some(message) = taken else { break };

        let publish_start = Instant::now();
        match publisher.publish(&message.payload).await {
            Ok(()) => {
                metrics.publish_time += publish_start.elapsed();
                latency.record_published(message.range.first, Instant::now());
                published_count.fetch_add(message.num_records(), Ordering::Relaxed);
                metrics.num_ipc_published += 1;
                metrics.num_jsons_published += message.num_records();
            }
            Err(e) => {
                error!(
                    error = %e,
                    bytes = message.payload.len(),
                    records = message.num_records(),
                    "Publish failed, shutting down"
                );
                let _ = publisher.close().await;
                let _ = shutdown_tx.send(true);
                return Err(e);
            }
        }
    }

    let _ = publisher.close().await;
    metrics.thread_time = thread_start.elapsed();
    debug!(
        messages = metrics.num_ipc_published,
        jsons = metrics.num_jsons_published,
        "Publisher stopped"
    );
    Ok(metrics)
}
