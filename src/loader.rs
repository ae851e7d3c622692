use std::rc::Rc;

use crate::{
    batch_buffer::BatchBuffer, batch_function::BatchFunction, context::ExecutionContext, deferred::Deferred,
    identity::LoaderIdentity,
};

/// Batch loads values from some expensive resource, primarily intended for mitigating GraphQL's
/// N+1 problem.
///
/// A `Loader` is a handle on one identity's batch buffer inside an [`ExecutionContext`]. Users
/// call [`Loader::load`] and [`Loader::load_many`] to get [`Deferred`] values; the keys are
/// fetched by the identity's [`BatchFunction`] on the context's next dispatch tick, or come from
/// the context's cache if they were loaded before. Values fetched elsewhere can be added to the
/// cache with [`Loader::prime`] and [`Loader::prime_many`].
///
/// Handles are cheap to clone. Every handle for the same identity in the same context shares
/// the same buffer and cache.
pub struct Loader<F: BatchFunction> {
    context: ExecutionContext,
    buffer: Rc<BatchBuffer<F>>,
}

impl<F: BatchFunction> Clone for Loader<F> {
    fn clone(&self) -> Self {
        Self { context: self.context.clone(), buffer: Rc::clone(&self.buffer) }
    }
}

impl<F: BatchFunction> Loader<F> {
    pub(crate) fn new(context: ExecutionContext, buffer: Rc<BatchBuffer<F>>) -> Self {
        Self { context, buffer }
    }

    pub fn identity(&self) -> &LoaderIdentity {
        self.buffer.identity()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Loads a value from the underlying resource.
    ///
    /// Resolves to `None` if the batch function returned nothing for `key`, and fails if the
    /// batch holding `key` failed. If the key is already cached the returned value is settled.
    /// Otherwise the key is queued for the next dispatch tick, or joins the identical request
    /// that is already queued or in flight.
    ///
    /// Fails with [`MalformedRequest`](crate::LoadError::MalformedRequest) once the context has finished.
    pub fn load(&self, key: F::Key) -> Deferred<Option<F::Value>> {
        if self.context.is_finished() {
            return Deferred::failed(ExecutionContext::finished_error(self.identity()));
        }
        let (deferred, queued) = self.buffer.request(key);
        if queued {
            self.context.schedule();
        }
        deferred
    }

    /// Loads many values at once.
    ///
    /// Resolves to one entry per key, in key order, or fails with the first failing key.
    pub fn load_many<I>(&self, keys: I) -> Deferred<Vec<Option<F::Value>>>
    where
        I: IntoIterator<Item = F::Key>,
    {
        Deferred::all(keys.into_iter().map(|key| self.load(key)))
    }

    /// Loads `key` if there is one. A missing key resolves to `None` without queueing anything.
    pub fn load_optional(&self, key: Option<F::Key>) -> Deferred<Option<F::Value>> {
        match key {
            Some(key) => self.load(key),
            None => Deferred::resolved(None),
        }
    }

    /// Adds a value to the cache.
    ///
    /// Returns false, leaving the cache untouched, if the key is already cached, queued or in
    /// flight, or if the context has finished.
    pub fn prime(&self, key: F::Key, value: F::Value) -> bool {
        !self.context.is_finished() && self.buffer.prime(key, value)
    }

    /// Adds many values to the cache at once. Returns how many were added.
    pub fn prime_many(&self, key_vals: Vec<(F::Key, F::Value)>) -> usize {
        if self.context.is_finished() {
            return 0;
        }
        self.buffer.prime_many(key_vals)
    }

    #[cfg(feature = "stats")]
    pub fn stats(&self) -> crate::stats::DispatchStats {
        self.buffer.stats()
    }
}
