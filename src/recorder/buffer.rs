use log::{debug, warn};

use crate::storage::{RunId, RunStore};
use crate::telemetry::Sample;

/// Number of samples written to storage in one batch.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Batches the samples of one open run before writing them to storage.
///
/// Every batch is written at most once: a failed write is logged and the
/// batch is dropped, so an abnormal stop loses at most one batch and the
/// stored samples keep their recording order.
#[derive(Debug)]
pub struct SampleBuffer {
    run_id: RunId,
    capacity: usize,
    pending: Vec<Sample>,
    written: usize,
    dropped: usize,
}

impl SampleBuffer {
    pub fn new(run_id: RunId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            run_id,
            capacity,
            pending: Vec::with_capacity(capacity),
            written: 0,
            dropped: 0,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Queue a sample, writing the batch out once it is full
    pub fn push<R: RunStore + ?Sized>(&mut self, store: &mut R, sample: Sample) {
        self.pending.push(sample);
        if self.pending.len() >= self.capacity {
            self.flush(store);
        }
    }

    /// Write whatever is pending, full batch or not
    pub fn flush<R: RunStore + ?Sized>(&mut self, store: &mut R) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        match store.append_samples(self.run_id, &batch) {
            Ok(()) => {
                self.written += batch.len();
                debug!("Flushed {} samples to run {}", batch.len(), self.run_id);
            }
            Err(e) => {
                self.dropped += batch.len();
                warn!(
                    "Dropping batch of {} samples for run {}: {}",
                    batch.len(),
                    self.run_id,
                    e
                );
            }
        }
        self.pending.reserve(self.capacity);
    }

    /// Samples successfully handed to storage
    pub fn written(&self) -> usize {
        self.written
    }

    /// Samples lost to failed batch writes
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
