use std::time::Instant;
use tokio::sync::mpsc;

/// Inclusive range of JSON sequence numbers covered by one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeqRange {
    pub first: u64,
    pub last: u64,
}

impl SeqRange {
    pub fn new(first: u64, last: u64) -> Self {
        debug_assert!(first <= last);
        Self { first, last }
    }

    /// Number of sequence numbers in the range.
    pub fn count(&self) -> u64 {
        self.last - self.first + 1
    }
}

/// A fixed-capacity byte buffer holding complete newline-terminated JSON
/// records, sealed with the sequence range it covers.
#[derive(Debug)]
pub struct JsonBuffer {
    data: Vec<u8>,
    size: usize,
    range: Option<SeqRange>,
    recv_time: Instant,
}

impl JsonBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            size: 0,
            range: None,
            recv_time: Instant::now(),
        }
    }

    /// Build a sealed buffer from raw bytes. Used by the parse salvage path
    /// and by tests.
    pub fn from_bytes(bytes: &[u8], range: SeqRange) -> Self {
        Self {
            data: bytes.to_vec(),
            size: bytes.len(),
            range: Some(range),
            recv_time: Instant::now(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.size == self.data.len()
    }

    /// The filled portion of the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// The unfilled remainder, for the receiver to read into.
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.data[self.size..]
    }

    /// Mark `n` bytes of the spare region as filled.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.size + n <= self.data.len());
        self.size += n;
    }

    /// Drop the last `n` filled bytes (a trailing partial record that moves
    /// to the carry slab).
    pub fn truncate_tail(&mut self, n: usize) {
        debug_assert!(n <= self.size);
        self.size -= n;
    }

    pub fn seal(&mut self, range: SeqRange, recv_time: Instant) {
        self.range = Some(range);
        self.recv_time = recv_time;
    }

    /// Sequence range of the records in the buffer. Only sealed buffers
    /// reach the converter, so this panics on an unsealed buffer.
    pub fn range(&self) -> SeqRange {
        self.range.expect("buffer not sealed")
    }

    pub fn recv_time(&self) -> Instant {
        self.recv_time
    }

    pub fn reset(&mut self) {
        self.size = 0;
        self.range = None;
    }
}

/// Fixed set of reusable JSON buffers.
///
/// Implemented as a bounded free-list channel: the receiver awaits a free
/// buffer, workers send buffers back once serialization is done. Pool
/// exhaustion is what backpressures the receiver when the converter falls
/// behind.
pub struct BufferPool {
    free: mpsc::Receiver<JsonBuffer>,
    release: mpsc::Sender<JsonBuffer>,
}

impl BufferPool {
    pub fn new(num_buffers: usize, capacity: usize) -> Self {
        let (release, free) = mpsc::channel(num_buffers);
        for _ in 0..num_buffers {
            release
                .try_send(JsonBuffer::new(capacity))
                .expect("pool channel sized to buffer count");
        }
        Self { free, release }
    }

    /// A handle workers use to return buffers to the pool.
    pub fn release_handle(&self) -> BufferReturn {
        BufferReturn {
            tx: self.release.clone(),
        }
    }

    /// Take a free buffer, waiting until one is returned.
    pub async fn acquire(&mut self) -> JsonBuffer {
        self.free
            .recv()
            .await
            .expect("pool keeps a release sender alive")
    }
}

/// Sending half of the buffer pool's free list.
#[derive(Clone)]
pub struct BufferReturn {
    tx: mpsc::Sender<JsonBuffer>,
}

impl BufferReturn {
    /// Reset the buffer and hand it back. A pool that is already gone means
    /// the pipeline is tearing down, in which case the buffer is dropped.
    pub async fn release(&self, mut buffer: JsonBuffer) {
        buffer.reset();
        let _ = self.tx.send(buffer).await;
    }
}
