use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};
use tracing_futures::Instrument;

#[cfg(feature = "stats")]
use crate::stats::DispatchStats;
use crate::{
    batch_function::BatchFunction, cache::Cache, deferred::Deferred, error::LoadError, identity::LoaderIdentity,
};

type Outcome<V> = Result<Option<V>, LoadError>;

/// A requested key that has not settled yet, either queued for the next tick or in flight.
///
/// Every requester of the key shares the one deferred value.
struct PendingKey<V> {
    deferred: Deferred<Option<V>>,
    requesters: u32,
}

struct BufferState<K, V> {
    /// Distinct keys waiting for the next dispatch, in request order.
    queued: Vec<K>,
    /// Queued and in-flight keys.
    pending: HashMap<K, PendingKey<V>>,
    cache: HashMap<K, Outcome<V>>,
    #[cfg(feature = "stats")]
    stats: DispatchStats,
}

/// What the dispatcher learns from one flushed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BatchSummary {
    pub identity: LoaderIdentity,
    pub keys: usize,
    pub found: usize,
    pub failed: bool,
}

/// The batch buffer, in-flight set and result cache of one loader identity.
///
/// A buffer can be in one of three states for any key:
///
/// 1. Unknown: the first request queues the key and creates its [`PendingKey`].
/// 2. Pending: the key is queued or its batch is in flight. Further requests attach to the
///    existing pending key instead of queueing it again.
/// 3. Cached: the batch for the key completed. Its outcome, value, absence or failure, is
///    returned to every later request without fetching again.
pub(crate) struct BatchBuffer<F: BatchFunction> {
    batch_fn: F,
    identity: LoaderIdentity,
    state: RefCell<BufferState<F::Key, F::Value>>,
}

impl<F: BatchFunction> BatchBuffer<F> {
    pub fn new(batch_fn: F) -> Self {
        let identity = batch_fn.identity().clone();
        Self {
            batch_fn,
            identity,
            state: RefCell::new(BufferState {
                queued: Vec::new(),
                pending: HashMap::new(),
                cache: HashMap::new(),
                #[cfg(feature = "stats")]
                stats: DispatchStats::default(),
            }),
        }
    }

    pub fn identity(&self) -> &LoaderIdentity {
        &self.identity
    }

    /// Returns the deferred outcome for `key`, and whether the key was newly queued.
    pub fn request(&self, key: F::Key) -> (Deferred<Option<F::Value>>, bool) {
        let mut state = self.state.borrow_mut();
        #[cfg(feature = "stats")]
        state.stats.record_request();

        if let Some(outcome) = state.cache.lookup(&key) {
            let outcome = outcome.clone();
            #[cfg(feature = "stats")]
            state.stats.record_cache_hit();
            return (Deferred::from(outcome), false);
        }

        if let Some(pending) = state.pending.get_mut(&key) {
            pending.requesters += 1;
            let deferred = pending.deferred.clone();
            #[cfg(feature = "stats")]
            state.stats.record_joined();
            tracing::trace!(identity = %self.identity, ?key, "attached to pending key");
            return (deferred, false);
        }

        let deferred = Deferred::pending();
        tracing::trace!(identity = %self.identity, ?key, "queued key");
        state.queued.push(key.clone());
        state.pending.insert(key, PendingKey { deferred: deferred.clone(), requesters: 1 });
        (deferred, true)
    }

    /// Caches `value` for `key` when the key is neither cached nor pending.
    pub fn prime(&self, key: F::Key, value: F::Value) -> bool {
        let mut state = self.state.borrow_mut();
        if state.pending.contains_key(&key) {
            return false;
        }
        state.cache.insert_once(key, Ok(Some(value)))
    }

    pub fn prime_many(&self, key_vals: Vec<(F::Key, F::Value)>) -> usize {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        let pending = &state.pending;
        let primable: Vec<(F::Key, Outcome<F::Value>)> = key_vals
            .into_iter()
            .filter(|(key, _)| !pending.contains_key(key))
            .map(|(key, value)| (key, Ok(Some(value))))
            .collect();
        state.cache.insert_many_once(primable)
    }

    #[cfg(feature = "stats")]
    pub fn stats(&self) -> DispatchStats {
        self.state.borrow().stats.clone()
    }

    /// Runs the batch function over `keys`, caches every outcome, then settles the pending
    /// keys in key order.
    async fn execute_load(&self, keys: Vec<F::Key>) -> BatchSummary {
        tracing::debug!(?keys, "invoking batch function");
        let outcomes: Vec<Outcome<F::Value>> = match self.batch_fn.load(&keys).await {
            Ok(loaded) => match loaded.align(&keys) {
                Ok(values) => values.into_iter().map(Ok).collect(),
                Err(returned) => {
                    let err = LoadError::MisalignedBatch {
                        identity: self.identity.clone(),
                        requested: keys.len(),
                        returned,
                    };
                    tracing::error!(%err, "batch result does not line up with its keys");
                    vec![Err(err); keys.len()]
                }
            },
            Err(source) => {
                let err = LoadError::batch_fetch(&self.identity, source);
                tracing::error!(%err, "batch fetch failed");
                vec![Err(err); keys.len()]
            }
        };

        let summary = BatchSummary {
            identity: self.identity.clone(),
            keys: keys.len(),
            found: outcomes.iter().filter(|outcome| matches!(outcome, Ok(Some(_)))).count(),
            failed: outcomes.first().map_or(false, Result::is_err),
        };

        let mut settled = Vec::with_capacity(keys.len());
        {
            let mut state = self.state.borrow_mut();
            #[cfg(feature = "stats")]
            state.stats.record_batch_completed(summary.found as u32, summary.failed);
            for (key, outcome) in keys.into_iter().zip(outcomes) {
                let pending = state.pending.remove(&key);
                state.cache.insert_once(key, outcome.clone());
                match pending {
                    Some(pending) => settled.push((pending, outcome)),
                    None => tracing::warn!(identity = %self.identity, "dispatched key had no pending entry"),
                }
            }
        }

        // Continuations may queue more keys on this buffer, so the state is released first.
        for (pending, outcome) in settled {
            tracing::trace!(requesters = pending.requesters, "settling key");
            pending.deferred.settle(outcome);
        }
        tracing::debug!(found = summary.found, failed = summary.failed, "batch settled");
        summary
    }
}

#[cfg(feature = "stats")]
impl<F: BatchFunction> Drop for BatchBuffer<F> {
    fn drop(&mut self) {
        tracing::debug!(identity = %self.identity, dispatch_stats = ?self.state.borrow().stats);
    }
}

/// The type-erased face of a [`BatchBuffer`], as held by the dispatcher.
pub(crate) trait Dispatchable {
    /// Takes every queued key and returns the future fetching them, or `None` when nothing is
    /// queued. The keys count as in flight until the future completes.
    fn dispatch(self: Rc<Self>) -> Option<LocalBoxFuture<'static, BatchSummary>>;

    /// Drops the queued keys without fetching them. Returns how many were dropped.
    fn discard_queued(&self) -> usize;

    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<F: BatchFunction> Dispatchable for BatchBuffer<F> {
    fn dispatch(self: Rc<Self>) -> Option<LocalBoxFuture<'static, BatchSummary>> {
        let keys = {
            let mut state = self.state.borrow_mut();
            if state.queued.is_empty() {
                return None;
            }
            let keys = mem::take(&mut state.queued);
            #[cfg(feature = "stats")]
            state.stats.record_batch(keys.len() as u32);
            keys
        };
        let span = tracing::debug_span!("batch", identity = %self.identity, keys = keys.len());
        Some(async move { self.execute_load(keys).await }.instrument(span).boxed_local())
    }

    fn discard_queued(&self) -> usize {
        let mut state = self.state.borrow_mut();
        let queued = mem::take(&mut state.queued);
        for key in queued.iter() {
            state.pending.remove(key);
        }
        queued.len()
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}
