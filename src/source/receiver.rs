use crate::latency::LatencyTracker;
use crate::source::buffer::{BufferPool, JsonBuffer, SeqRange};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    #[error("a single record exceeds the buffer capacity of {capacity} bytes")]
    RecordTooLarge { capacity: usize },

    #[error("pipeline shut down before the stream ended")]
    Shutdown,
}

/// Counters for the reception stage.
#[derive(Debug, Default, Clone)]
pub struct ReceiveMetrics {
    /// JSONs framed and handed to the converter.
    pub num_jsons: u64,
    /// Raw bytes read from the source.
    pub num_bytes: u64,
    /// Wall time spent receiving, connect to EOF.
    pub receive_time: Duration,
}

/// Fill buffers from a newline-delimited JSON byte stream.
///
/// Complete records stay in the buffer; a trailing partial record is carried
/// into the next buffer. Each framed record gets the next sequence number,
/// starting at `seq_start`; the counter is owned exclusively by this task.
/// Buffers seal on buffer-full, source EOF, or shutdown, and the sealed
/// range's first sequence number is stamped in the latency tracker.
///
/// EOF closes the JSON queue (the channel close is the end-of-stream
/// sentinel for the workers) and returns the reception metrics.
pub async fn run_receiver<R>(
    mut source: R,
    mut pool: BufferPool,
    json_tx: mpsc::Sender<JsonBuffer>,
    latency: LatencyTracker,
    received_count: Arc<AtomicU64>,
    seq_start: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ReceiveMetrics, ReceiveError>
where
    R: AsyncRead + Unpin,
{
    let start = Instant::now();
    let mut metrics = ReceiveMetrics::default();
    let mut seq = seq_start;
    let mut carry: Vec<u8> = Vec::new();
    let mut eof = false;
    let mut interrupted = false;

    while !eof && !interrupted {
        let mut buffer = tokio::select! {
            buffer = pool.acquire() => buffer,
            _ = shutdown.wait_for(|stop| *stop) => {
                metrics.receive_time = start.elapsed();
                return Err(ReceiveError::Shutdown);
            }
        };

        // The carry slab holds a partial record from the previous buffer.
        if carry.len() >= buffer.capacity() {
            return Err(ReceiveError::RecordTooLarge {
                capacity: buffer.capacity(),
            });
        }
        buffer.spare()[..carry.len()].copy_from_slice(&carry);
        buffer.advance(carry.len());
        carry.clear();

        let mut complete: u64 = 0;
        while !buffer.is_full() {
            let n = tokio::select! {
                n = source.read(buffer.spare()) => n?,
                _ = shutdown.wait_for(|stop| *stop) => {
                    interrupted = true;
                    break;
                }
            };
            if n == 0 {
                eof = true;
                break;
            }
            let window = buffer.len();
            buffer.advance(n);
            metrics.num_bytes += n as u64;
            complete += buffer.bytes()[window..window + n]
                .iter()
                .filter(|b| **b == b'\n')
                .count() as u64;
        }

        if eof {
            // A dangling record without terminator still counts.
            if !buffer.is_empty() && buffer.bytes()[buffer.len() - 1] != b'\n' {
                complete += 1;
            }
        } else {
            // Buffer full (or interrupt): keep only complete records, carry
            // the partial tail over.
            match buffer.bytes().iter().rposition(|b| *b == b'\n') {
                Some(last_nl) => {
                    let tail = buffer.len() - (last_nl + 1);
                    if tail > 0 {
                        carry.extend_from_slice(&buffer.bytes()[last_nl + 1..]);
                        buffer.truncate_tail(tail);
                    }
                }
                None if buffer.is_full() => {
                    return Err(ReceiveError::RecordTooLarge {
                        capacity: buffer.capacity(),
                    });
                }
                None => {
                    carry.extend_from_slice(buffer.bytes());
                    let len = buffer.len();
                    buffer.truncate_tail(len);
                }
            }
        }

        if complete > 0 {
            let range = SeqRange::new(seq, seq + complete - 1);
            seq += complete;
            let recv_time = Instant::now();
            buffer.seal(range, recv_time);
            latency.record_recv(range.first, recv_time);
            received_count.fetch_add(complete, Ordering::Relaxed);
            metrics.num_jsons += complete;
            debug!(
                first = range.first,
                last = range.last,
                bytes = buffer.len(),
                "Sealed buffer"
            );

            if interrupted {
                let _ = json_tx.try_send(buffer);
            } else {
                tokio::select! {
                    sent = json_tx.send(buffer) => {
                        if sent.is_err() {
                            metrics.receive_time = start.elapsed();
                            return Err(ReceiveError::Shutdown);
                        }
                    }
                    _ = shutdown.wait_for(|stop| *stop) => {
                        metrics.receive_time = start.elapsed();
                        return Err(ReceiveError::Shutdown);
                    }
                }
            }
        }
    }

    metrics.receive_time = start.elapsed();

    if interrupted {
        return Err(ReceiveError::Shutdown);
    }

    info!(
        jsons = metrics.num_jsons,
        bytes = metrics.num_bytes,
        "Source stream ended"
    );

    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Harness {
        latency: LatencyTracker,
        received: Arc<AtomicU64>,
        _shutdown_tx: watch::Sender<bool>,
    }

    async fn receive_all(
        input: &[u8],
        num_buffers: usize,
        capacity: usize,
    ) -> (Result<ReceiveMetrics, ReceiveError>, Harness, Vec<JsonBuffer>) {
        let pool = BufferPool::new(num_buffers, capacity);
        let release = pool.release_handle();
        let (json_tx, mut json_rx) = mpsc::channel(num_buffers);
        let latency = LatencyTracker::default();
        let received = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let source = Cursor::new(input.to_vec());
        let recv_task = tokio::spawn(run_receiver(
            source,
            pool,
            json_tx,
            latency.clone(),
            received.clone(),
            0,
            shutdown_rx,
        ));

        // Drain sealed buffers, returning them to the pool so the receiver
        // never starves.
        let mut sealed = Vec::new();
        while let Some(buffer) = json_rx.recv().await {
            sealed.push(JsonBuffer::from_bytes(buffer.bytes(), buffer.range()));
            release.release(buffer).await;
        }

        let result = recv_task.await.unwrap();
        drop(json_rx);
        let harness = Harness {
            latency,
            received,
            _shutdown_tx: shutdown_tx,
        };
        (result, harness, sealed)
    }

    #[tokio::test]
    async fn test_single_buffer_framing() {
        let input = b"{\"v\":1}\n{\"v\":2}\n{\"v\":3}\n";
        let (result, harness, sealed) = receive_all(input, 2, 1024).await;

        let metrics = result.unwrap();
        assert_eq!(metrics.num_jsons, 3);
        assert_eq!(metrics.num_bytes, input.len() as u64);
        assert_eq!(harness.received.load(Ordering::Relaxed), 3);

        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].range(), SeqRange::new(0, 2));
        assert_eq!(sealed[0].bytes(), input);
    }

    #[tokio::test]
    async fn test_partial_record_carries_over() {
        // Capacity 16 splits the stream mid-record.
        let input = b"{\"v\":1000}\n{\"v\":2000}\n{\"v\":3000}\n";
        let (result, _harness, sealed) = receive_all(input, 3, 16).await;

        let metrics = result.unwrap();
        assert_eq!(metrics.num_jsons, 3);

        // Every sealed buffer holds only complete records.
        for buffer in &sealed {
            assert_eq!(buffer.bytes().last(), Some(&b'\n'));
        }

        // Ranges partition the sequence space in order.
        let mut next = 0;
        for buffer in &sealed {
            assert_eq!(buffer.range().first, next);
            next = buffer.range().last + 1;
        }
        assert_eq!(next, 3);

        // Concatenating the buffers reproduces the input.
        let rejoined: Vec<u8> = sealed.iter().flat_map(|b| b.bytes().to_vec()).collect();
        assert_eq!(rejoined, input);
    }

    #[tokio::test]
    async fn test_record_larger_than_capacity_fails() {
        let input = b"{\"v\":\"0123456789012345678901234567890123456789\"}\n";
        let (result, _harness, _sealed) = receive_all(input, 2, 16).await;
        assert!(matches!(
            result,
            Err(ReceiveError::RecordTooLarge { capacity: 16 })
        ));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let (result, harness, sealed) = receive_all(b"", 2, 64).await;
        let metrics = result.unwrap();
        assert_eq!(metrics.num_jsons, 0);
        assert_eq!(harness.received.load(Ordering::Relaxed), 0);
        assert!(sealed.is_empty());
    }

    #[tokio::test]
    async fn test_buffer_exactly_at_capacity() {
        // Input is exactly one buffer: the trailing record must not be lost.
        let input = b"{\"v\":12}\n{\"v\":34}\n";
        assert_eq!(input.len(), 18);
        let (result, _harness, sealed) = receive_all(input, 2, 18).await;

        let metrics = result.unwrap();
        assert_eq!(metrics.num_jsons, 2);
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].range(), SeqRange::new(0, 1));
        assert_eq!(sealed[0].bytes(), input);
    }

    #[tokio::test]
    async fn test_missing_final_terminator_counts_as_record() {
        let input = b"{\"v\":1}\n{\"v\":2}";
        let (result, _harness, sealed) = receive_all(input, 2, 64).await;

        let metrics = result.unwrap();
        assert_eq!(metrics.num_jsons, 2);
        assert_eq!(sealed[0].range(), SeqRange::new(0, 1));
    }

    #[tokio::test]
    async fn test_latency_recv_stamped_for_first_seq() {
        let input = b"{\"v\":1}\n{\"v\":2}\n";
        let (result, harness, sealed) = receive_all(input, 2, 64).await;
        result.unwrap();

        let measurements = harness.latency.measurements();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].0, sealed[0].range().first);
    }
}
