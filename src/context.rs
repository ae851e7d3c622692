use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use futures::future;
use tokio::sync::Notify;
use tracing_futures::Instrument;

use crate::{
    batch_buffer::{BatchBuffer, Dispatchable},
    batch_function::BatchFunction,
    config::DispatchConfig,
    deferred::Deferred,
    error::LoadError,
    identity::LoaderIdentity,
    loader::Loader,
};

#[derive(Default)]
struct Registry {
    buffers: Vec<Rc<dyn Dispatchable>>,
    index: HashMap<LoaderIdentity, usize>,
}

struct ContextInner {
    config: DispatchConfig,
    registry: RefCell<Registry>,
    /// Set when a key is queued, cleared when a tick takes the queued batches.
    scheduled: Cell<bool>,
    ticks: Cell<u64>,
    /// Ticks whose batches have been taken but not yet settled.
    in_flight: Cell<usize>,
    tick_done: Notify,
    finished: Cell<bool>,
}

/// Counts a tick as in flight until dropped, then wakes everything waiting on a tick.
struct InFlightTick<'a>(&'a ContextInner);

impl<'a> InFlightTick<'a> {
    fn start(inner: &'a ContextInner) -> Self {
        inner.in_flight.set(inner.in_flight.get() + 1);
        Self(inner)
    }
}

impl Drop for InFlightTick<'_> {
    fn drop(&mut self) {
        self.0.in_flight.set(self.0.in_flight.get() - 1);
        self.0.tick_done.notify_waiters();
    }
}

/// The scope of one request or query execution.
///
/// An `ExecutionContext` owns the batch buffer and result cache of every loader identity used
/// while executing one query. Field resolvers request values through [`Loader`]s bound to the
/// context and receive [`Deferred`] values; the host executor drives the context by calling
/// [`ExecutionContext::dispatch`] once per scheduling tick (or [`ExecutionContext::resolve`],
/// which ticks until a given value settles).
///
/// All requests made between two ticks are visible to the next tick, which invokes each
/// identity's [`BatchFunction`] exactly once with all of its distinct queued keys. Batches of
/// different identities run concurrently on the current task and settle in no particular order.
///
/// The context is cheap to clone and single-threaded. Separate requests use separate contexts
/// and never share cached outcomes.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Rc<ContextInner>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

impl ExecutionContext {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                config,
                registry: RefCell::new(Registry::default()),
                scheduled: Cell::new(false),
                ticks: Cell::new(0),
                in_flight: Cell::new(0),
                tick_done: Notify::new(),
                finished: Cell::new(false),
            }),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    /// Binds `batch_fn` to this context.
    ///
    /// The first loader bound for an identity creates its buffer. Later loaders with an equal
    /// identity share that buffer, and `batch_fn` itself is dropped. Binding a batch function of
    /// a different type under an identity that is already in use is a
    /// [`LoadError::MalformedRequest`], as is binding after [`ExecutionContext::finish`].
    pub fn loader<F: BatchFunction>(&self, batch_fn: F) -> Result<Loader<F>, LoadError> {
        if self.is_finished() {
            return Err(Self::finished_error(batch_fn.identity()));
        }
        let mut registry = self.inner.registry.borrow_mut();
        let existing = registry.index.get(batch_fn.identity()).copied();
        let buffer = match existing {
            Some(slot) => Rc::clone(&registry.buffers[slot]).into_any().downcast::<BatchBuffer<F>>().map_err(|_| {
                LoadError::MalformedRequest(format!(
                    "loader identity {} is already bound to a different batch function",
                    batch_fn.identity()
                ))
            })?,
            None => {
                let identity = batch_fn.identity().clone();
                tracing::debug!(%identity, "registering loader");
                let buffer = Rc::new(BatchBuffer::new(batch_fn));
                let slot = registry.buffers.len();
                registry.buffers.push(buffer.clone());
                registry.index.insert(identity, slot);
                buffer
            }
        };
        Ok(Loader::new(self.clone(), buffer))
    }

    /// Requests `key` from the loader for `batch_fn`.
    ///
    /// Shorthand for [`ExecutionContext::loader`] followed by [`Loader::load`]. Binding errors
    /// come back as an already failed deferred value.
    pub fn load<F: BatchFunction>(&self, batch_fn: F, key: F::Key) -> Deferred<Option<F::Value>> {
        match self.loader(batch_fn) {
            Ok(loader) => loader.load(key),
            Err(err) => Deferred::failed(err),
        }
    }

    pub(crate) fn schedule(&self) {
        self.inner.scheduled.set(true);
    }

    /// Whether keys are queued for the next tick.
    pub fn has_pending(&self) -> bool {
        self.inner.scheduled.get()
    }

    /// Whether batches taken by a tick are still being fetched.
    pub fn has_in_flight(&self) -> bool {
        self.inner.in_flight.get() > 0
    }

    /// Whether [`ExecutionContext::finish`] has ended this context.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.get()
    }

    pub(crate) fn finished_error(identity: &LoaderIdentity) -> LoadError {
        LoadError::MalformedRequest(format!("loader {identity} used after its execution context finished"))
    }

    /// Number of ticks dispatched so far.
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.get()
    }

    /// Runs one tick: flushes every identity with queued keys exactly once and waits for those
    /// batches to settle. Returns the number of batches dispatched.
    ///
    /// Keys queued by continuations while the tick runs go to the next tick.
    pub async fn dispatch(&self) -> usize {
        if !self.inner.scheduled.replace(false) {
            return 0;
        }
        let tick = self.inner.ticks.get() + 1;
        self.inner.ticks.set(tick);
        let _in_flight = InFlightTick::start(&self.inner);

        let batches = {
            let registry = self.inner.registry.borrow();
            registry.buffers.iter().filter_map(|buffer| Rc::clone(buffer).dispatch()).collect::<Vec<_>>()
        };
        let span = tracing::debug_span!("dispatch", tick, batches = batches.len());
        let summaries = future::join_all(batches).instrument(span).await;

        for summary in summaries.iter().filter(|summary| summary.failed) {
            tracing::debug!(identity = %summary.identity, keys = summary.keys, "batch failed this tick");
        }
        let failed = summaries.iter().filter(|summary| summary.failed).count();
        let keys: usize = summaries.iter().map(|summary| summary.keys).sum();
        tracing::debug!(tick, batches = summaries.len(), keys, failed, "tick complete");
        summaries.len()
    }

    /// Runs ticks until no keys are queued and no batch is in flight. Returns the number of
    /// ticks this call dispatched itself.
    ///
    /// Ticks started by another driver of the same context are waited for, not repeated.
    pub async fn run_until_idle(&self) -> Result<u64, LoadError> {
        let mut ticks = 0;
        loop {
            if self.has_pending() {
                self.check_tick_budget(ticks)?;
                self.dispatch().await;
                ticks += 1;
                self.yield_between_ticks().await;
            } else if self.has_in_flight() {
                self.inner.tick_done.notified().await;
            } else {
                return Ok(ticks);
            }
        }
    }

    /// Runs ticks until `deferred` settles and returns its outcome.
    ///
    /// While another driver's tick is in flight and nothing is queued, waits for that tick
    /// instead of starting one. Fails with [`LoadError::Stalled`] if the value is still pending
    /// once nothing is queued or in flight on this context, e.g. because it was produced by
    /// another context.
    pub async fn resolve<T: Clone + 'static>(&self, deferred: Deferred<T>) -> Result<T, LoadError> {
        let mut ticks = 0;
        loop {
            if let Some(outcome) = deferred.peek() {
                return outcome;
            }
            if self.has_pending() {
                self.check_tick_budget(ticks)?;
                self.dispatch().await;
                ticks += 1;
                self.yield_between_ticks().await;
            } else if self.has_in_flight() {
                self.inner.tick_done.notified().await;
            } else {
                tracing::error!(ticks, "resolving a deferred value that no queued batch can settle");
                return Err(LoadError::Stalled { ticks });
            }
        }
    }

    /// Ends the context, dropping every loader buffer and cached outcome.
    ///
    /// Keys that were queued but never dispatched stay pending forever; their count is
    /// returned. Loader handles that outlive the context fail every later load with
    /// [`LoadError::MalformedRequest`].
    pub fn finish(&self) -> usize {
        self.inner.finished.set(true);
        let registry = std::mem::take(&mut *self.inner.registry.borrow_mut());
        self.inner.scheduled.set(false);
        let abandoned: usize = registry.buffers.iter().map(|buffer| buffer.discard_queued()).sum();
        if abandoned > 0 {
            tracing::warn!(abandoned, "finished execution context with undispatched keys");
        }
        abandoned
    }

    fn check_tick_budget(&self, ticks: u64) -> Result<(), LoadError> {
        match self.inner.config.max_ticks {
            Some(limit) if ticks >= limit => {
                tracing::error!(limit, "dispatch tick limit exceeded");
                Err(LoadError::TickLimitExceeded { limit })
            }
            _ => Ok(()),
        }
    }

    async fn yield_between_ticks(&self) {
        if self.inner.config.yield_between_ticks {
            tokio::task::yield_now().await;
        }
    }
}
