use crate::convert::parser::{JsonParser, ParsedBatch};
use crate::convert::resizer::Resizer;
use crate::convert::serializer::{SerializedBatch, Serializer};
use crate::convert::ConvertError;
use crate::latency::LatencyTracker;
use crate::source::{BufferReturn, JsonBuffer, SeqRange};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, warn};

/// Process-wide lock for parser backends that need exclusive access to a
/// shared hardware interface.
static EXCLUSIVE_PARSER_LOCK: Mutex<()> = Mutex::const_new(());

/// Per-worker conversion counters and cumulative stage times.
#[derive(Debug, Default, Clone)]
pub struct ConvertMetrics {
    /// JSONs converted into record batches.
    pub num_jsons: u64,
    /// Raw JSON bytes consumed.
    pub num_json_bytes: u64,
    /// Buffers taken from the JSON queue.
    pub num_buffers: u64,
    /// IPC messages produced.
    pub num_ipc: u64,
    /// Total bytes across produced IPC messages.
    pub ipc_bytes: u64,
    /// Records dropped because they failed to parse.
    pub parse_errors: u64,
    pub parse_time: Duration,
    pub resize_time: Duration,
    pub serialize_time: Duration,
    pub thread_time: Duration,
}

impl ConvertMetrics {
    pub fn merge(&mut self, other: &ConvertMetrics) {
        self.num_jsons += other.num_jsons;
        self.num_json_bytes += other.num_json_bytes;
        self.num_buffers += other.num_buffers;
        self.num_ipc += other.num_ipc;
        self.ipc_bytes += other.ipc_bytes;
        self.parse_errors += other.parse_errors;
        self.parse_time += other.parse_time;
        self.resize_time += other.resize_time;
        self.serialize_time += other.serialize_time;
        self.thread_time += other.thread_time;
    }
}

/// One converter worker: takes sealed buffers off the JSON queue, parses,
/// resizes, serializes, pushes messages onto the IPC queue, and returns the
/// buffer to the pool.
///
/// The worker exits cleanly when the JSON queue closes after draining, or
/// promptly when the shutdown flag trips. Parse failures drop the offending
/// records (salvaging the rest of the buffer) and are only counted; resize
/// and serialize failures are fatal, trip the shutdown flag, and surface
/// through the returned result.
#[allow(clippy::too_many_arguments)]
pub async fn run_worker(
    id: usize,
    mut parser: Box<dyn JsonParser>,
    resizer: Resizer,
    serializer: Serializer,
    json_rx: Arc<Mutex<mpsc::Receiver<JsonBuffer>>>,
    ipc_tx: mpsc::Sender<SerializedBatch>,
    release: BufferReturn,
    latency: LatencyTracker,
    dropped_count: Arc<AtomicU64>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ConvertMetrics, ConvertError> {
    let thread_start = Instant::now();
    let mut metrics = ConvertMetrics::default();
    debug!(worker = id, "Converter worker started");

    loop {
        // Only one worker can hold the queue lock; the others block on it,
        // which is equivalent to blocking on the queue itself.
        let taken = {
            let mut rx = json_rx.lock().await;
            tokio::select! {
                buffer = rx.recv() => buffer,
                _ = shutdown.wait_for(|stop| *stop) => None,
            }
        };
        let Some(buffer) = taken else { break };

        let first_seq = buffer.range().first;
        let parse_start = Instant::now();
        let parse_result = if parser.needs_exclusive_access() {
            let _guard = EXCLUSIVE_PARSER_LOCK.lock().await;
            parser.parse(&[&buffer])
        } else {
            parser.parse(&[&buffer])
        };
        let parsed = match parse_result {
            Ok(batches) => batches,
            Err(e) => {
                warn!(
                    worker = id,
                    first = first_seq,
                    error = %e,
                    "Parse failed, salvaging buffer record by record"
                );
                let (batches, errors) = salvage(parser.as_mut(), &buffer);
                metrics.parse_errors += errors;
                dropped_count.fetch_add(errors, Ordering::Relaxed);
                batches
            }
        };
        metrics.parse_time += parse_start.elapsed();
        metrics.num_buffers += 1;
        metrics.num_json_bytes += buffer.len() as u64;
        latency.record_parsed(first_seq, Instant::now());

        let converted = convert_batches(&resizer, &serializer, parsed, &mut metrics, &latency);
        release.release(buffer).await;

        let messages = match converted {
            Ok(messages) => messages,
            Err(e) => {
                error!(worker = id, error = %e, "Conversion failed, shutting down");
                let _ = shutdown_tx.send(true);
                return Err(e);
            }
        };

        for message in messages {
            if ipc_tx.send(message).await.is_err() {
                debug!(worker = id, "IPC queue closed, stopping");
                metrics.thread_time = thread_start.elapsed();
                return Ok(metrics);
            }
        }
    }

    metrics.thread_time = thread_start.elapsed();
    debug!(worker = id, buffers = metrics.num_buffers, "Converter worker stopped");
    Ok(metrics)
}

fn convert_batches(
    resizer: &Resizer,
    serializer: &Serializer,
    parsed: Vec<ParsedBatch>,
    metrics: &mut ConvertMetrics,
    latency: &LatencyTracker,
) -> Result<Vec<SerializedBatch>, ConvertError> {
    let mut messages = Vec::new();
    for batch in parsed {
        metrics.num_jsons += batch.batch.num_rows() as u64;

        let resize_start = Instant::now();
        let pieces = resizer.resize(batch)?;
        metrics.resize_time += resize_start.elapsed();

        let serialize_start = Instant::now();
        let serialized = serializer.serialize(pieces)?;
        metrics.serialize_time += serialize_start.elapsed();

        let now = Instant::now();
        for message in &serialized {
            latency.record_serialized(message.range.first, now);
            metrics.num_ipc += 1;
            metrics.ipc_bytes += message.payload.len() as u64;
        }
        messages.extend(serialized);
    }
    Ok(messages)
}

/// Re-parse a failed buffer line by line, batching runs of consecutive good
/// records and dropping the malformed ones. Returns the salvaged batches
/// and the number of dropped records.
fn salvage(parser: &mut dyn JsonParser, buffer: &JsonBuffer) -> (Vec<ParsedBatch>, u64) {
    let mut batches = Vec::new();
    let mut errors: u64 = 0;
    let mut seq = buffer.range().first;
    let mut run: Vec<u8> = Vec::new();
    let mut run_first = seq;
    let mut run_count: u64 = 0;

    for line in buffer.bytes().split_inclusive(|b| *b == b'\n') {
        let probe = JsonBuffer::from_bytes(line, SeqRange::new(seq, seq));
        if parser.parse(&[&probe]).is_ok() {
            if run_count == 0 {
                run_first = seq;
            }
            run.extend_from_slice(line);
            run_count += 1;
        } else {
            errors += 1;
            flush_run(parser, &mut run, run_first, &mut run_count, &mut batches, &mut errors);
        }
        seq += 1;
    }
    flush_run(parser, &mut run, run_first, &mut run_count, &mut batches, &mut errors);

    (batches, errors)
}

fn flush_run(
    parser: &mut dyn JsonParser,
    run: &mut Vec<u8>,
    run_first: u64,
    run_count: &mut u64,
    batches: &mut Vec<ParsedBatch>,
    errors: &mut u64,
) {
    if *run_count == 0 {
        return;
    }
    let buffer = JsonBuffer::from_bytes(run, SeqRange::new(run_first, run_first + *run_count - 1));
    match parser.parse(&[&buffer]) {
        Ok(mut parsed) => batches.append(&mut parsed),
        // Individually validated lines failing as a run should not happen;
        // count them as dropped rather than losing track of them silently.
        Err(_) => *errors += *run_count,
    }
    run.clear();
    *run_count = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{FieldConfig, FieldType, ParseConfig, SchemaConfig};
    use crate::convert::parser::ArrowJsonParser;
    use crate::source::BufferPool;

    fn make_parser(seq_column: bool) -> Box<dyn JsonParser> {
        let schema = SchemaConfig {
            fields: vec![FieldConfig {
                name: "v".to_string(),
                field_type: FieldType::Int64,
                nullable: true,
                item: None,
            }],
        }
        .to_arrow();
        Box::new(ArrowJsonParser::new(schema, ParseConfig::default(), seq_column))
    }

    #[test]
    fn test_salvage_drops_only_bad_records() {
        let mut parser = make_parser(false);
        let text = "{\"v\":1}\nBROKEN\n{\"v\":3}\n{\"v\":4}\nALSO BAD\n{\"v\":6}\n";
        let buffer = JsonBuffer::from_bytes(text.as_bytes(), SeqRange::new(0, 5));

        let (batches, errors) = salvage(parser.as_mut(), &buffer);
        assert_eq!(errors, 2);

        // Runs of good records stay contiguous: [0,0], [2,3], [5,5].
        let ranges: Vec<SeqRange> = batches.iter().map(|b| b.range).collect();
        assert_eq!(
            ranges,
            vec![
                SeqRange::new(0, 0),
                SeqRange::new(2, 3),
                SeqRange::new(5, 5)
            ]
        );
        let total_rows: usize = batches.iter().map(|b| b.batch.num_rows()).sum();
        assert_eq!(total_rows, 4);
    }

    #[test]
    fn test_salvage_all_bad() {
        let mut parser = make_parser(false);
        let buffer = JsonBuffer::from_bytes(b"nope\nstill nope\n", SeqRange::new(10, 11));

        let (batches, errors) = salvage(parser.as_mut(), &buffer);
        assert!(batches.is_empty());
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn test_worker_converts_and_releases() {
        let mut pool = BufferPool::new(2, 1024);
        let release = pool.release_handle();
        // Drain one slot: the buffer below is built manually (not acquired
        // from the pool), so the pool's free list must have room for the
        // worker's eventual release.
        let _ = pool.acquire().await;
        let (json_tx, json_rx) = mpsc::channel(2);
        let json_rx = Arc::new(Mutex::new(json_rx));
        let (ipc_tx, mut ipc_rx) = mpsc::channel(4);
        let latency = LatencyTracker::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let worker = tokio::spawn(run_worker(
            0,
            make_parser(true),
            Resizer::new(1_000_000, 0.9),
            Serializer::new(1_000_000),
            json_rx,
            ipc_tx,
            release,
            latency.clone(),
            Arc::new(AtomicU64::new(0)),
            shutdown_tx,
            shutdown_rx,
        ));

        let buffer = JsonBuffer::from_bytes(b"{\"v\":1}\n{\"v\":2}\n", SeqRange::new(0, 1));
        latency.record_recv(0, Instant::now());
        json_tx.send(buffer).await.unwrap();
        drop(json_tx);

        let message = ipc_rx.recv().await.unwrap();
        assert_eq!(message.range, SeqRange::new(0, 1));
        assert_eq!(message.num_records(), 2);

        let metrics = worker.await.unwrap().unwrap();
        assert_eq!(metrics.num_jsons, 2);
        assert_eq!(metrics.num_buffers, 1);
        assert_eq!(metrics.num_ipc, 1);
        assert_eq!(metrics.parse_errors, 0);
        assert!(metrics.ipc_bytes > 0);

        // Latency parsed/serialized stamps landed for the buffer's first seq.
        let (_, points) = latency.measurements()[0];
        assert!(points.parsed.is_some());
        assert!(points.serialized.is_some());
    }

    #[tokio::test]
    async fn test_worker_oversized_row_is_fatal_and_trips_shutdown() {
        let mut pool = BufferPool::new(2, 1 << 20);
        let release = pool.release_handle();
        // Drain one slot: the buffer below is built manually (not acquired
        // from the pool), so the pool's free list must have room for the
        // worker's eventual release.
        let _ = pool.acquire().await;
        let (json_tx, json_rx) = mpsc::channel(2);
        let json_rx = Arc::new(Mutex::new(json_rx));
        let (ipc_tx, _ipc_rx) = mpsc::channel(4);
        let latency = LatencyTracker::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let shutdown_probe = shutdown_tx.subscribe();

        let schema = SchemaConfig {
            fields: vec![FieldConfig {
                name: "s".to_string(),
                field_type: FieldType::Utf8,
                nullable: true,
                item: None,
            }],
        }
        .to_arrow();
        let parser = Box::new(ArrowJsonParser::new(schema, ParseConfig::default(), false));

        let worker = tokio::spawn(run_worker(
            0,
            parser,
            Resizer::new(128, 0.9),
            Serializer::new(128),
            json_rx,
            ipc_tx,
            release,
            latency,
            Arc::new(AtomicU64::new(0)),
            shutdown_tx,
            shutdown_rx,
        ));

        let record = format!("{{\"s\":\"{}\"}}\n", "x".repeat(4096));
        let buffer = JsonBuffer::from_bytes(record.as_bytes(), SeqRange::new(0, 0));
        json_tx.send(buffer).await.unwrap();
        drop(json_tx);

        let result = worker.await.unwrap();
        assert!(matches!(result, Err(ConvertError::OversizedRow { .. })));
        assert!(*shutdown_probe.borrow());
    }

    #[test]
    fn test_metrics_merge() {
        let mut a = ConvertMetrics {
            num_jsons: 10,
            num_ipc: 2,
            parse_errors: 1,
            parse_time: Duration::from_micros(100),
            ..ConvertMetrics::default()
        };
        let b = ConvertMetrics {
            num_jsons: 5,
            num_ipc: 1,
            parse_errors: 0,
            parse_time: Duration::from_micros(50),
            ..ConvertMetrics::default()
        };
        a.merge(&b);
        assert_eq!(a.num_jsons, 15);
        assert_eq!(a.num_ipc, 3);
        assert_eq!(a.parse_errors, 1);
        assert_eq!(a.parse_time, Duration::from_micros(150));
    }
}
