//! Batching of decoded payloads into bounded request bodies.
//!
//! Payloads are concatenated byte for byte. With the byte policy a batch is
//! flushed *before* a payload that would push it over the threshold, and that
//! payload seeds the next batch, so a single payload larger than the
//! threshold travels alone rather than being split or dropped.

use tracing::{debug, warn};

/// Default byte threshold for a batch.
pub const DEFAULT_BATCH_BYTES: usize = 100_000;

/// When the accumulator is turned into a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Flush before appending a payload that would exceed this many bytes
    Bytes(usize),

    /// Flush once this many payloads have been accumulated
    Lines(usize),
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy::Bytes(DEFAULT_BATCH_BYTES)
    }
}

/// How long one accumulator lives in a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchScope {
    /// Flush at the end of every member
    #[default]
    PerMember,

    /// Keep accumulating across members, flush at the end of the archive
    PerRun,
}

/// A flushed batch, ready to be delivered as one request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    bytes: Vec<u8>,
    payloads: usize,
}

impl Batch {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Number of payloads concatenated into this batch.
    pub fn payloads(&self) -> usize {
        self.payloads
    }

    /// Size of the batch in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the batch holds no bytes, even if empty payloads were
    /// appended to it.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn push(&mut self, payload: &[u8]) {
        self.bytes.extend_from_slice(payload);
        self.payloads += 1;
    }
}

/// Statistics about batching operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatcherStats {
    /// Total number of payloads appended
    pub payloads_received: u64,

    /// Total number of batches emitted
    pub batches_emitted: u64,

    /// Batches emitted because the byte threshold would be exceeded
    pub size_flushes: u64,

    /// Batches emitted because the line count was reached
    pub line_flushes: u64,

    /// Batches emitted by an explicit flush at end of stream
    pub final_flushes: u64,

    /// Payloads that alone exceed the byte threshold
    pub oversized_payloads: u64,
}

/// Accumulates payloads and emits batches according to a [`FlushPolicy`].
#[derive(Debug)]
pub struct Batcher {
    policy: FlushPolicy,
    current: Batch,
    stats: BatcherStats,
}

impl Batcher {
    pub fn new(policy: FlushPolicy) -> Self {
        let capacity = match policy {
            FlushPolicy::Bytes(threshold) => threshold.min(DEFAULT_BATCH_BYTES),
            FlushPolicy::Lines(_) => 0,
        };
        Self {
            policy,
            current: Batch {
                bytes: Vec::with_capacity(capacity),
                payloads: 0,
            },
            stats: BatcherStats::default(),
        }
    }

    /// Append one payload, returning the batch it displaced, if any.
    pub fn append(&mut self, payload: impl AsRef<[u8]>) -> Option<Batch> {
        let payload = payload.as_ref();
        self.stats.payloads_received += 1;

        match self.policy {
            FlushPolicy::Bytes(threshold) => {
                if payload.len() > threshold {
                    self.stats.oversized_payloads += 1;
                    warn!(
                        payload_bytes = payload.len(),
                        threshold = threshold,
                        "Payload exceeds batch threshold, sending it on its own"
                    );
                }

                if self.current.len() + payload.len() > threshold {
                    let flushed = self.take();
                    self.current.push(payload);
                    if let Some(batch) = &flushed {
                        self.stats.size_flushes += 1;
                        debug!(
                            batch_bytes = batch.len(),
                            payloads = batch.payloads(),
                            "Flushing batch: byte threshold reached"
                        );
                    }
                    flushed
                } else {
                    self.current.push(payload);
                    None
                }
            }
            FlushPolicy::Lines(lines) => {
                self.current.push(payload);
                if self.current.payloads() < lines {
                    return None;
                }
                let flushed = self.take();
                if let Some(batch) = &flushed {
                    self.stats.line_flushes += 1;
                    debug!(
                        batch_bytes = batch.len(),
                        payloads = batch.payloads(),
                        "Flushing batch: line count reached"
                    );
                }
                flushed
            }
        }
    }

    /// Emit whatever is accumulated, leaving the batcher empty.
    pub fn flush(&mut self) -> Option<Batch> {
        let flushed = self.take();
        if let Some(batch) = &flushed {
            self.stats.final_flushes += 1;
            debug!(
                batch_bytes = batch.len(),
                payloads = batch.payloads(),
                "Flushing remaining payloads"
            );
        }
        flushed
    }

    /// Bytes currently accumulated.
    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    pub fn stats(&self) -> &BatcherStats {
        &self.stats
    }

    /// Reset the accumulator, returning it only if it holds bytes.
    fn take(&mut self) -> Option<Batch> {
        let batch = std::mem::take(&mut self.current);
        if batch.is_empty() {
            return None;
        }
        self.stats.batches_emitted += 1;
        Some(batch)
    }
}
