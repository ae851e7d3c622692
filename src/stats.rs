/// Counters for one loader identity over the lifetime of its context.
///
/// Only collected with the `stats` feature. They are reported through `tracing` when the
/// owning context drops the loader's buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchStats {
    /// Number of single-key requests made through the loader.
    pub load_requests: u32,
    /// Requests answered from the result cache.
    pub cache_hits: u32,
    /// Requests that attached to a key already queued or in flight.
    pub joined_pending: u32,
    /// Number of batch function invocations.
    pub batches: u32,
    /// Total keys handed to the batch function.
    pub keys_fetched: u32,
    /// Keys that resolved to a value.
    pub values_found: u32,
    /// Batches whose fetch failed or came back misaligned.
    pub failed_batches: u32,
    /// The average number of keys per batch.
    pub average_batch_size: f32,
    /// The max number of keys fetched in a single batch.
    pub max_batch_size: u32,
    /// The min number of keys fetched in a single batch.
    pub min_batch_size: u32,
}

impl DispatchStats {
    pub(crate) fn record_request(&mut self) {
        self.load_requests += 1;
    }

    pub(crate) fn record_cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub(crate) fn record_joined(&mut self) {
        self.joined_pending += 1;
    }

    pub(crate) fn record_batch(&mut self, batch_size: u32) {
        let new_total = self.batches + 1;
        self.average_batch_size = (((self.average_batch_size as f64 * self.batches as f64) + batch_size as f64)
            / new_total as f64) as f32;
        if self.batches == 0 || batch_size < self.min_batch_size {
            self.min_batch_size = batch_size;
        }
        if batch_size > self.max_batch_size {
            self.max_batch_size = batch_size;
        }
        self.batches = new_total;
        self.keys_fetched += batch_size;
    }

    pub(crate) fn record_batch_completed(&mut self, values_found: u32, failed: bool) {
        self.values_found += values_found;
        if failed {
            self.failed_batches += 1;
        }
    }
}
