use crate::config::types::Config;
use crate::convert::{
    run_worker, ArrowJsonParser, ConvertError, ConvertMetrics, Resizer, SerializedBatch,
    Serializer,
};
use crate::latency::LatencyTracker;
use crate::publish::{run_publisher, BatchPublisher, PublishError};
use crate::source::{run_receiver, BufferPool, JsonBuffer, ReceiveError};
use crate::stats::StreamStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

/// Errors that can end a pipeline run. The variant names the failing stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("receiver: {0}")]
    Receive(#[from] ReceiveError),

    #[error("converter: {0}")]
    Convert(#[from] ConvertError),

    #[error("publisher: {0}")]
    Publish(#[from] PublishError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result of a completed run: aggregated statistics plus the latency
/// measurements collected along the way.
pub struct PipelineReport {
    pub stats: StreamStats,
    pub latency: LatencyTracker,
}

/// Run the three-stage pipeline over `source` until it reaches EOF, then
/// drain and shut down.
///
/// One receiver task fills pooled buffers from the byte stream; N converter
/// workers turn buffers into serialized IPC messages; one publisher pushes
/// them to the bus. A single watch flag broadcasts fatal shutdown; the
/// normal end of stream propagates as channel closes, so pending work is
/// drained, never dropped.
///
/// After receiver EOF the supervisor polls until every received record is
/// either published or dropped by a parse failure, then trips the flag and
/// joins all stages. The run fails if any stage failed.
pub async fn run<R>(
    config: &Config,
    source: R,
    publisher: Box<dyn BatchPublisher>,
) -> Result<PipelineReport, PipelineError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let convert = &config.convert;
    let num_workers = convert.num_workers;
    let num_buffers = convert.effective_num_buffers();

    let pool = BufferPool::new(num_buffers, convert.buffer_capacity);
    let release = pool.release_handle();
    let (json_tx, json_rx) = mpsc::channel::<JsonBuffer>(num_buffers);
    let json_rx = Arc::new(Mutex::new(json_rx));
    let (ipc_tx, ipc_rx) =
        mpsc::channel::<SerializedBatch>(convert.effective_ipc_queue_capacity());

    let latency = LatencyTracker::default();
    let received_count = Arc::new(AtomicU64::new(0));
    let published_count = Arc::new(AtomicU64::new(0));
    let dropped_count = Arc::new(AtomicU64::new(0));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    info!(
        workers = num_workers,
        buffers = num_buffers,
        buffer_capacity = convert.buffer_capacity,
        max_ipc_size = convert.max_ipc_size,
        "Starting pipeline"
    );

    let receiver_handle = tokio::spawn(run_receiver(
        source,
        pool,
        json_tx,
        latency.clone(),
        received_count.clone(),
        convert.seq_start,
        shutdown_rx.clone(),
    ));

    let schema = config.schema.to_arrow();
    let mut worker_handles = Vec::with_capacity(num_workers);
    for id in 0..num_workers {
        let parser = Box::new(ArrowJsonParser::new(
            schema.clone(),
            config.parse.clone(),
            convert.seq_column,
        ));
        worker_handles.push(tokio::spawn(run_worker(
            id,
            parser,
            Resizer::new(convert.max_ipc_size, convert.size_hint),
            Serializer::new(convert.max_ipc_size),
            json_rx.clone(),
            ipc_tx.clone(),
            release.clone(),
            latency.clone(),
            dropped_count.clone(),
            shutdown_tx.clone(),
            shutdown_rx.clone(),
        )));
    }
    drop(ipc_tx);

    let publisher_handle = tokio::spawn(run_publisher(
        publisher,
        ipc_rx,
        latency.clone(),
        published_count.clone(),
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));

    // The receiver ends on source EOF, or with an error on a fatal
    // condition (its own, or a shutdown tripped elsewhere).
    let receive_result = receiver_handle.await?;

    // Bounded wait until every received record is accounted for, either
    // published or dropped by a parse failure.
    if receive_result.is_ok() {
        let total = received_count.load(Ordering::Relaxed);
        let poll = convert.poll_interval();
        loop {
            let published = published_count.load(Ordering::Relaxed);
            let dropped = dropped_count.load(Ordering::Relaxed);
            if published + dropped >= total || *shutdown_rx.borrow() {
                break;
            }
            debug!(total, published, dropped, "Waiting for drain");
            tokio::time::sleep(poll).await;
        }
    }

    let _ = shutdown_tx.send(true);

    let mut worker_metrics: Vec<ConvertMetrics> = Vec::with_capacity(num_workers);
    let mut convert_error: Option<ConvertError> = None;
    for handle in worker_handles {
        match handle.await? {
            Ok(metrics) => worker_metrics.push(metrics),
            Err(e) => convert_error = Some(convert_error.take().unwrap_or(e)),
        }
    }
    let publish_result = publisher_handle.await?;

    // Surface the most significant failure: converter and publisher errors
    // are the cause of the shutdown the receiver then observed.
    let publish_metrics = publish_result?;
    if let Some(e) = convert_error {
        return Err(e.into());
    }
    let receive_metrics = receive_result?;

    let first_latency = latency.first_latency();
    let stats = StreamStats::aggregate(
        receive_metrics,
        worker_metrics,
        publish_metrics,
        first_latency,
    );

    info!(
        received = stats.receive.num_jsons,
        published = stats.publish.num_jsons_published,
        messages = stats.publish.num_ipc_published,
        parse_errors = stats.convert.parse_errors,
        "Pipeline finished"
    );

    Ok(PipelineReport { stats, latency })
}
